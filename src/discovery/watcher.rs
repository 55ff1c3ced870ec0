//! 服务监听句柄

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::discovery::instance::ServiceInstance;
use crate::discovery::service_set::{ServiceSet, ServiceSetTable};
use crate::error::{RegistryError, Result};

/// 服务监听句柄
///
/// `next()` 在快照更新或句柄取消前挂起，返回的是最新快照的副本而不是增量事件。
/// 句柄被丢弃时自动 `stop()`。
pub struct ServiceWatcher {
    id: u64,
    set: Arc<ServiceSet>,
    table: ServiceSetTable,
    signal: Arc<Notify>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl ServiceWatcher {
    pub(crate) fn attach(
        set: Arc<ServiceSet>,
        table: ServiceSetTable,
        cancel: CancellationToken,
    ) -> Self {
        let (id, signal) = set.attach();
        Self {
            id,
            set,
            table,
            signal,
            cancel,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn service_name(&self) -> &str {
        self.set.service_name()
    }

    /// 等待下一次实例变化
    ///
    /// 停止或注册中心关闭后立即返回 `RegistryError::Cancelled`。
    pub async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RegistryError::Cancelled),
            _ = self.signal.notified() => Ok(self.set.snapshot().as_ref().clone()),
        }
    }

    /// 停止监听（幂等）
    ///
    /// 最后一个监听者停止时取消解析循环并从映射表中移除服务集合。
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if self.set.detach(self.id) && self.table.release(&self.set) {
            info!(service = %self.set.service_name(), "Service set torn down");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ServiceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWatcher")
            .field("id", &self.id)
            .field("service", &self.set.service_name())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
