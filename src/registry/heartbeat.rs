//! TTL 心跳会话
//!
//! 每个注册的服务 ID 至多一个存活会话。会话状态：
//! Starting（短暂延迟）→ Renewing（按间隔发送 TTL pass）→ 失败时 Backoff（随机抖动）
//! → Reregistering（用注册时捕获的载荷原样重新注册）→ 成功后回到 Renewing。
//!
//! 替换会话是两阶段握手：先取消旧会话，等待其任务结束，再启动新会话，
//! 保证同一个 TTL 检查上不会有两个心跳循环并发。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::discovery::backend::{AgentRegistration, CheckStatus, RegistryBackend};
use crate::error::{RegistryError, Result};
use crate::retry::{JitterRetryPolicy, RetryPolicy};
use crate::utils::with_timeout;

/// 注册后首次 TTL pass 前的延迟
const INITIAL_HEARTBEAT_DELAY: Duration = Duration::from_secs(1);

struct HeartbeatContext {
    backend: Arc<dyn RegistryBackend>,
    interval: Duration,
    call_timeout: Option<Duration>,
    retry: JitterRetryPolicy,
    log_every: usize,
    root: CancellationToken,
}

/// 单个服务 ID 的心跳会话
struct HeartbeatSession {
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

impl HeartbeatSession {
    /// 取消并等待任务结束
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.done.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}

type SessionSlot = Arc<tokio::sync::Mutex<Option<HeartbeatSession>>>;

/// 心跳会话管理器
///
/// 按服务 ID 串行化会话的启动、替换和停止。
pub struct HeartbeatManager {
    ctx: Arc<HeartbeatContext>,
    slots: Mutex<HashMap<String, SessionSlot>>,
}

impl HeartbeatManager {
    pub fn new(
        backend: Arc<dyn RegistryBackend>,
        config: &RegistryConfig,
        root: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(HeartbeatContext {
                backend,
                interval: config.heartbeat_interval(),
                call_timeout: config.call_timeout(),
                retry: JitterRetryPolicy::unbounded(config.heartbeat_max_jitter()),
                log_every: config.heartbeat_log_every.max(1) as usize,
                root,
            }),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, service_id: &str) -> SessionSlot {
        self.slots
            .lock()
            .entry(service_id.to_string())
            .or_default()
            .clone()
    }

    /// 移除已清空的槽位
    ///
    /// 只有表和调用方持有该槽位时才移除；其他调用方持有说明它正在排队使用，
    /// 移除会让后来者新建槽位，失去按服务 ID 的串行化。
    fn release_slot(&self, service_id: &str, slot: SessionSlot) {
        let mut slots = self.slots.lock();
        if let Some(current) = slots.get(service_id) {
            if Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2 {
                slots.remove(service_id);
            }
        }
    }

    /// 当前跟踪的服务 ID 数
    pub fn tracked(&self) -> usize {
        self.slots.lock().len()
    }

    /// 启动心跳会话，已有会话时先取消并等待其结束
    ///
    /// 注册载荷不含 TTL 检查时不启动。
    pub async fn start(&self, registration: AgentRegistration) {
        let Some(check_id) = registration.ttl_check_id().map(str::to_string) else {
            debug!(service_id = %registration.id, "No TTL check, heartbeat not started");
            return;
        };

        let slot = self.slot(&registration.id);
        let mut current = slot.lock().await;
        if let Some(previous) = current.take() {
            previous.stop().await;
            debug!(service_id = %registration.id, "Previous heartbeat session replaced");
        }

        let cancel = self.ctx.root.child_token();
        let service_id = registration.id.clone();
        let done = tokio::spawn(run_session(
            self.ctx.clone(),
            registration,
            check_id,
            cancel.clone(),
        ));
        *current = Some(HeartbeatSession { cancel, done });
        info!(service_id = %service_id, "💓 Heartbeat session started");
    }

    /// 停止心跳会话并等待结束，返回是否存在会话
    pub async fn stop(&self, service_id: &str) -> bool {
        let slot = self.slots.lock().get(service_id).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let session = slot.lock().await.take();
        let stopped = match session {
            Some(session) => {
                session.stop().await;
                info!(service_id = %service_id, "🛑 Heartbeat session stopped");
                true
            }
            None => false,
        };
        self.release_slot(service_id, slot);
        stopped
    }

    /// 停止全部会话
    pub async fn stop_all(&self) -> usize {
        let slots: Vec<(String, SessionSlot)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut stopped = 0;
        for (service_id, slot) in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                session.stop().await;
                stopped += 1;
            }
            self.release_slot(&service_id, slot);
        }
        stopped
    }

    pub async fn is_active(&self, service_id: &str) -> bool {
        let slot = self.slots.lock().get(service_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }
}

/// 等待 `duration`，期间被取消返回 false
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run_session(
    ctx: Arc<HeartbeatContext>,
    registration: AgentRegistration,
    check_id: String,
    cancel: CancellationToken,
) {
    let service_id = registration.id.clone();

    // Starting
    if sleep_or_cancel(&cancel, INITIAL_HEARTBEAT_DELAY).await {
        let mut ticker = tokio::time::interval_at(Instant::now() + ctx.interval, ctx.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Renewing
        loop {
            match pass_ttl(&ctx, &check_id, &cancel).await {
                Ok(()) => debug!(service_id = %service_id, "💓 Heartbeat sent"),
                Err(RegistryError::Cancelled) => break,
                Err(e) => {
                    warn!(
                        service_id = %service_id,
                        error = %e,
                        "⚠️ Failed to send heartbeat, re-registering"
                    );
                    if reregister(&ctx, &registration, &cancel).await {
                        continue;
                    }
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }
    }

    // Stopped：只有进程级关闭（根令牌取消）才注销，替换和显式注销由调用方负责
    if ctx.root.is_cancelled() {
        deregister_on_shutdown(&ctx, &service_id).await;
    }
    debug!(service_id = %service_id, "Heartbeat session finished");
}

async fn pass_ttl(
    ctx: &HeartbeatContext,
    check_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        result = with_timeout(
            ctx.call_timeout,
            ctx.backend.update_ttl_check(check_id, CheckStatus::Passing, ""),
        ) => result,
    }
}

/// Backoff / Reregistering，直到成功或被取消
async fn reregister(
    ctx: &HeartbeatContext,
    registration: &AgentRegistration,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        if !sleep_or_cancel(cancel, ctx.retry.backoff_duration(attempt)).await {
            return false;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = with_timeout(ctx.call_timeout, ctx.backend.register_service(registration)) => result,
        };

        match result {
            Ok(()) => {
                info!(
                    service_id = %registration.id,
                    attempt = attempt,
                    "✅ Service re-registered"
                );
                return true;
            }
            Err(e) => {
                if !ctx.retry.should_retry(attempt, &e) {
                    return false;
                }
                if (attempt - 1) % ctx.log_every == 0 {
                    warn!(
                        service_id = %registration.id,
                        error = %e,
                        attempt = attempt,
                        "⚠️ Failed to re-register service"
                    );
                }
            }
        }
    }
}

async fn deregister_on_shutdown(ctx: &HeartbeatContext, service_id: &str) {
    match with_timeout(ctx.call_timeout, ctx.backend.deregister_service(service_id)).await {
        Ok(()) => info!(service_id = %service_id, "✅ Service deregistered on shutdown"),
        Err(e) if e.is_not_found() => {
            debug!(service_id = %service_id, "Service already gone on shutdown")
        }
        Err(e) => warn!(
            service_id = %service_id,
            error = %e,
            "⚠️ Failed to deregister service on shutdown"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::MemoryBackend;
    use crate::registry::registration::build_registration;
    use crate::ServiceInstance;

    fn manager(backend: Arc<MemoryBackend>) -> HeartbeatManager {
        let config = RegistryConfig::default()
            .with_health_check(false)
            .with_heartbeat(true);
        HeartbeatManager::new(backend, &config, CancellationToken::new())
    }

    fn registration(id: &str) -> AgentRegistration {
        let config = RegistryConfig::default()
            .with_health_check(false)
            .with_heartbeat(true);
        let instance = ServiceInstance::new(id, "orders").with_endpoint("grpc://10.0.0.1:9000");
        build_registration(&instance, &config).expect("valid instance")
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sessions_release_their_slot() {
        let heartbeats = manager(Arc::new(MemoryBackend::new()));

        for i in 0..10 {
            let id = format!("orders-{}", i);
            heartbeats.start(registration(&id)).await;
            assert!(heartbeats.is_active(&id).await);
            assert!(heartbeats.stop(&id).await);
            assert!(!heartbeats.is_active(&id).await);
        }
        assert_eq!(heartbeats.tracked(), 0);

        // 没有会话的 ID 不会留下槽位
        assert!(!heartbeats.stop("unknown").await);
        assert_eq!(heartbeats.tracked(), 0);

        heartbeats.start(registration("a")).await;
        heartbeats.start(registration("b")).await;
        assert_eq!(heartbeats.tracked(), 2);
        assert_eq!(heartbeats.stop_all().await, 2);
        assert_eq!(heartbeats.tracked(), 0);
    }
}
