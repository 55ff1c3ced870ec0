//! 服务注册中心客户端
//!
//! [`Registry`] 同时实现 [`Registrar`] 和 [`Discovery`]：
//! - 注册时构建 agent 载荷，可选附加 TCP/TTL 检查并启动心跳会话
//! - 发现时按服务名维护实例缓存，监听句柄共享同一个后台解析循环
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use flare_discovery::{Registry, RegistryConfig, ServiceInstance};
//!
//! # async fn example() -> flare_discovery::Result<()> {
//! let registry = Registry::connect(RegistryConfig::default())?;
//!
//! let instance = ServiceInstance::new("orders-1", "orders")
//!     .with_version("v1")
//!     .with_endpoint("grpc://10.0.0.5:9000");
//! registry.register(&instance).await?;
//!
//! let watcher = registry.get_watcher("orders").await?;
//! let instances = watcher.next().await?;
//! println!("orders: {} instances", instances.len());
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod heartbeat;
pub mod registration;
pub mod trait_def;

pub use heartbeat::HeartbeatManager;
pub use registration::{build_registration, ttl_check_id};
pub use trait_def::{Discovery, KvProvider, KvWatch, Registrar, Watcher};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::discovery::backend::{ConsulBackend, RegistryBackend};
use crate::discovery::instance::ServiceInstance;
use crate::discovery::resolver::Resolver;
use crate::discovery::service_set::{ServiceSet, ServiceSetTable};
use crate::discovery::watcher::ServiceWatcher;
use crate::error::{RegistryError, Result};
use crate::kv::KvStore;
use crate::retry::FixedRetryPolicy;
use crate::utils::with_timeout;

/// 服务注册中心客户端
///
/// 克隆开销低，所有克隆共享同一份缓存和心跳会话。
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    backend: Arc<dyn RegistryBackend>,
    config: RegistryConfig,
    resolver: Resolver,
    sets: ServiceSetTable,
    heartbeats: HeartbeatManager,
    shutdown: CancellationToken,
}

impl Registry {
    /// 使用任意后端创建注册中心客户端
    pub fn new(backend: Arc<dyn RegistryBackend>, config: RegistryConfig) -> Self {
        let shutdown = CancellationToken::new();
        let resolver = Resolver::new(backend.clone(), &config);
        let heartbeats = HeartbeatManager::new(backend.clone(), &config, shutdown.clone());
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                config,
                resolver,
                sets: ServiceSetTable::new(),
                heartbeats,
                shutdown,
            }),
        }
    }

    /// 连接 Consul agent
    pub fn connect(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let backend = ConsulBackend::new(&config)?;
        info!(address = %config.address, mode = ?config.datacenter_mode, "Registry client created");
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> Arc<dyn RegistryBackend> {
        self.inner.backend.clone()
    }

    /// 基于同一后端的 KV 存储
    pub fn kv(&self) -> KvStore {
        KvStore::new(self.inner.backend.clone(), &self.inner.config)
            .with_parent_token(&self.inner.shutdown)
    }

    /// 注册服务实例
    ///
    /// 后端错误直接返回，不做同步重试；注册成功后的瞬时故障由心跳会话恢复。
    pub async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let registration = registration::build_registration(instance, &inner.config)?;

        with_timeout(
            inner.config.call_timeout(),
            inner.backend.register_service(&registration),
        )
        .await?;
        info!(
            service = %instance.name,
            service_id = %instance.id,
            endpoints = ?instance.endpoints,
            "✅ Service registered"
        );

        if inner.config.heartbeat {
            inner.heartbeats.start(registration).await;
        }
        Ok(())
    }

    /// 注销服务实例
    ///
    /// 先停止心跳会话并等待结束，再发起注销；后端返回"不存在"视为成功。
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.heartbeats.stop(service_id).await;

        match with_timeout(
            inner.config.call_timeout(),
            inner.backend.deregister_service(service_id),
        )
        .await
        {
            Ok(()) => {
                info!(service_id = %service_id, "✅ Service deregistered");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(service_id = %service_id, "Service already deregistered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 获取服务实例快照
    ///
    /// 命中非空缓存时直接返回，否则直接查询一次后端（不建立监听）。
    pub async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        if let Some(set) = self.inner.sets.get(service_name) {
            let cached = set.snapshot();
            if !cached.is_empty() {
                return Ok(cached.as_ref().clone());
            }
        }

        let instances = self.inner.resolver.resolve(service_name).await?;
        if instances.is_empty() {
            return Err(RegistryError::ServiceNotResolved(service_name.to_string()));
        }
        Ok(instances)
    }

    /// 获取服务监听句柄
    ///
    /// 首次监听某服务时创建服务集合并启动解析循环，等待首次解析尝试完成。
    /// 配置了创建时限且超时返回 `WatcherCreateTimeout`，解析循环继续在后台预热缓存。
    pub async fn get_watcher(&self, service_name: &str) -> Result<ServiceWatcher> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        let (set, created) = inner.sets.acquire(service_name, || {
            ServiceSet::new(service_name, inner.shutdown.child_token())
        });
        let watcher = ServiceWatcher::attach(
            set.clone(),
            inner.sets.clone(),
            inner.shutdown.child_token(),
        );

        if !created {
            debug!(service = %service_name, refs = set.ref_count(), "Watcher attached");
            return Ok(watcher);
        }

        tokio::spawn(set.clone().run(
            inner.resolver.clone(),
            inner.config.resolve_interval(),
            FixedRetryPolicy::unbounded(inner.config.resolve_retry_backoff()),
        ));
        info!(service = %service_name, "👀 Service watch created");

        match inner.config.watcher_create_timeout() {
            None => {
                set.first_attempt_done().await;
                Ok(watcher)
            }
            Some(limit) => {
                if tokio::time::timeout(limit, set.first_attempt_done())
                    .await
                    .is_ok()
                {
                    return Ok(watcher);
                }
                warn!(
                    service = %service_name,
                    timeout_ms = limit.as_millis() as u64,
                    "First resolution timed out, keeping resolve loop warm"
                );
                // 首次解析完成后再释放这张引用。期间没有其他监听者挂载时，
                // 集合随即销毁，缓存不会保留给后续的 get_service
                tokio::spawn(async move {
                    set.first_attempt_done().await;
                    watcher.stop();
                });
                Err(RegistryError::WatcherCreateTimeout {
                    service: service_name.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// 所有非空缓存的快照（不访问网络）
    pub fn list_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.inner.sets.snapshot()
    }

    /// 当前存活服务集合的服务名
    pub fn watched_services(&self) -> Vec<String> {
        self.inner.sets.names()
    }

    /// 某服务当前的监听引用数
    pub fn watcher_refs(&self, service_name: &str) -> usize {
        self.inner
            .sets
            .get(service_name)
            .map(|set| set.ref_count())
            .unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// 关闭注册中心客户端
    ///
    /// 停止所有解析循环，监听句柄返回 `Cancelled`，心跳会话尽力注销后结束。
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();
        inner.sets.clear();
        let stopped = inner.heartbeats.stop_all().await;
        info!(heartbeats = stopped, "🛑 Registry shut down");
    }
}

#[async_trait]
impl Registrar for Registry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        Registry::register(self, instance).await
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        Registry::deregister(self, service_id).await
    }
}

#[async_trait]
impl Discovery for Registry {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Registry::get_service(self, service_name).await
    }

    async fn get_watcher(&self, service_name: &str) -> Result<Box<dyn Watcher>> {
        let watcher = Registry::get_watcher(self, service_name).await?;
        Ok(Box::new(watcher))
    }
}

#[async_trait]
impl Watcher for ServiceWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        ServiceWatcher::next(self).await
    }

    fn stop(&self) -> Result<()> {
        ServiceWatcher::stop(self);
        Ok(())
    }
}
