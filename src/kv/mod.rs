//! KV 存储
//!
//! 注册中心自带 KV 的薄封装：单次读写直接透传后端，监听基于单键阻塞查询。

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::discovery::backend::{QueryOptions, RegistryBackend};
use crate::error::{RegistryError, Result};
use crate::registry::trait_def::{KvProvider, KvWatch};
use crate::utils::with_timeout;

/// KV 存储
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn RegistryBackend>,
    wait_time: Duration,
    call_timeout: Option<Duration>,
    blocking_timeout: Option<Duration>,
    parent: CancellationToken,
}

impl KvStore {
    pub fn new(backend: Arc<dyn RegistryBackend>, config: &RegistryConfig) -> Self {
        Self {
            backend,
            wait_time: config.wait_duration(),
            call_timeout: config.call_timeout(),
            blocking_timeout: config.blocking_call_timeout(),
            parent: CancellationToken::new(),
        }
    }

    /// 监听句柄随 `parent` 一起取消
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.parent = parent.clone();
        self
    }

    /// 读取键值，键不存在时返回 `RegistryError::KeyNotFound`
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let (value, _) = with_timeout(
            self.call_timeout,
            self.backend.kv_get(key, &QueryOptions::immediate()),
        )
        .await?;
        value.ok_or_else(|| RegistryError::KeyNotFound(key.to_string()))
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        with_timeout(self.call_timeout, self.backend.kv_put(key, value)).await?;
        debug!(key = %key, size = value.len(), "KV put");
        Ok(())
    }

    /// 删除键值，键不存在视为成功
    pub async fn delete(&self, key: &str) -> Result<()> {
        match with_timeout(self.call_timeout, self.backend.kv_delete(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 监听单个键
    ///
    /// 创建时读取一次当前索引，之后 `next()` 只返回创建之后的变化。
    pub async fn watch(&self, key: &str) -> Result<KvWatcher> {
        let (_, index) = with_timeout(
            self.call_timeout,
            self.backend.kv_get(key, &QueryOptions::immediate()),
        )
        .await?;
        info!(key = %key, index = index, "👀 KV watch created");
        Ok(KvWatcher {
            backend: self.backend.clone(),
            key: key.to_string(),
            index: tokio::sync::Mutex::new(index.max(1)),
            wait_time: self.wait_time,
            blocking_timeout: self.blocking_timeout,
            cancel: self.parent.child_token(),
            stopped: AtomicBool::new(false),
        })
    }
}

/// 单键监听句柄
pub struct KvWatcher {
    backend: Arc<dyn RegistryBackend>,
    key: String,
    index: tokio::sync::Mutex<u64>,
    wait_time: Duration,
    blocking_timeout: Option<Duration>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl KvWatcher {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 等待键变化
    ///
    /// 索引前进且键存在时返回 `Some(value)`，键已删除返回 `None`。
    /// 后端错误直接返回，索引保持不变，调用方可以再次调用。
    pub async fn next(&self) -> Result<Option<Vec<u8>>> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let mut index = self.index.lock().await;
        loop {
            let query = QueryOptions::blocking(*index, self.wait_time);
            let (value, new_index) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RegistryError::Cancelled),
                result = with_timeout(self.blocking_timeout, self.backend.kv_get(&self.key, &query)) => result?,
            };

            // 索引必须大于 0
            let new_index = new_index.max(1);
            if new_index < *index {
                // 索引回退（例如后端快照恢复），从头开始
                debug!(key = %self.key, old = *index, new = new_index, "KV index went backwards, resetting");
                *index = 0;
                continue;
            }
            if new_index == *index {
                continue;
            }
            *index = new_index;
            return Ok(value);
        }
    }

    /// 停止监听（幂等），取消正在进行的阻塞查询
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            debug!(key = %self.key, "KV watch stopped");
        }
    }
}

impl Drop for KvWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl KvProvider for KvStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        KvStore::put(self, key, value).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        KvStore::get(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        KvStore::delete(self, key).await
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn KvWatch>> {
        let watcher = KvStore::watch(self, key).await?;
        Ok(Box::new(watcher))
    }
}

#[async_trait]
impl KvWatch for KvWatcher {
    async fn next(&self) -> Result<Option<Vec<u8>>> {
        KvWatcher::next(self).await
    }

    fn stop(&self) -> Result<()> {
        KvWatcher::stop(self);
        Ok(())
    }
}
