//! 服务集合（按服务名的实例缓存）
//!
//! 每个被监听的服务名对应一个 [`ServiceSet`]：
//! - 最新实例快照（单写多读，整体原子替换）
//! - 已挂载的监听者，每个监听者持有一个单槽合并信号
//! - 引用计数，归零时取消后台解析循环并从表中移除
//!
//! 后台解析循环状态：Resolving（wait index 为 0 的首次查询）→ Watching（定时阻塞查询）→ Stopped。
//! 已看到的索引保存在循环持有的 [`ResolveCursor`] 中。

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::instance::ServiceInstance;
use crate::discovery::resolver::{ResolveCursor, Resolver};
use crate::retry::RetryPolicy;

/// 单个服务名的实例缓存及其监听者
pub struct ServiceSet {
    service_name: String,
    instances: ArcSwap<Vec<ServiceInstance>>,
    watchers: Mutex<HashMap<u64, Arc<Notify>>>,
    next_watcher_id: AtomicU64,
    ref_count: AtomicUsize,
    cancel: CancellationToken,
    first_attempt: watch::Sender<bool>,
}

impl ServiceSet {
    /// 创建服务集合，创建者持有第一张引用
    pub(crate) fn new(service_name: impl Into<String>, cancel: CancellationToken) -> Arc<Self> {
        let (first_attempt, _) = watch::channel(false);
        Arc::new(Self {
            service_name: service_name.into(),
            instances: ArcSwap::from_pointee(Vec::new()),
            watchers: Mutex::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(1),
            ref_count: AtomicUsize::new(1),
            cancel,
            first_attempt,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 当前实例快照
    pub fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.instances.load_full()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 引用计数大于 0 时加一；已归零的集合正在销毁，不可复用
    pub(crate) fn try_acquire(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count > 0).then_some(count + 1)
            })
            .is_ok()
    }

    /// 挂载监听者，缓存非空时立即置位信号
    pub(crate) fn attach(&self) -> (u64, Arc<Notify>) {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(Notify::new());
        self.watchers.lock().insert(id, signal.clone());
        if !self.instances.load().is_empty() {
            signal.notify_one();
        }
        (id, signal)
    }

    /// 卸载监听者并释放一张引用
    ///
    /// 返回 true 表示引用计数归零，解析循环已被取消。
    pub(crate) fn detach(&self, watcher_id: u64) -> bool {
        self.watchers.lock().remove(&watcher_id);
        let previous = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// 替换快照并唤醒所有监听者
    ///
    /// 每个信号最多保存一个许可，连续广播会合并，写入方从不阻塞。
    pub(crate) fn broadcast(&self, instances: Vec<ServiceInstance>) {
        self.instances.store(Arc::new(instances));
        for signal in self.watchers.lock().values() {
            signal.notify_one();
        }
    }

    fn mark_first_attempt_done(&self) {
        self.first_attempt.send_replace(true);
    }

    /// 等待首次解析尝试完成（无论成功与否）
    pub(crate) async fn first_attempt_done(&self) {
        let mut rx = self.first_attempt.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// 后台解析循环，直到集合被取消
    pub(crate) async fn run<P>(self: Arc<Self>, resolver: Resolver, interval: Duration, retry: P)
    where
        P: RetryPolicy,
    {
        let name = self.service_name.clone();
        let mut cursor = ResolveCursor::new();

        // Resolving
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.mark_first_attempt_done();
                debug!(service = %name, "Resolve loop cancelled before first resolution");
                return;
            }
            result = resolver.poll(&name, &mut cursor) => match result {
                Ok(changed) => {
                    let instances = changed.unwrap_or_default();
                    debug!(
                        service = %name,
                        count = instances.len(),
                        "Initial resolution finished"
                    );
                    if !instances.is_empty() {
                        self.broadcast(instances);
                    }
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Initial resolution failed, will keep retrying");
                }
            }
        }
        self.mark_first_attempt_done();

        // Watching
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut failures = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = resolver.poll(&name, &mut cursor) => result,
            };

            match result {
                Ok(Some(instances)) if !instances.is_empty() => {
                    failures = 0;
                    info!(
                        service = %name,
                        count = instances.len(),
                        "Service instances changed"
                    );
                    self.broadcast(instances);
                }
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if !retry.should_retry(failures, &e) {
                        break;
                    }
                    warn!(
                        service = %name,
                        error = %e,
                        attempt = failures,
                        "Failed to resolve service, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry.backoff_duration(failures)) => {}
                    }
                }
            }
        }

        debug!(service = %name, "Resolve loop stopped");
    }
}

/// 服务名到服务集合的映射表
///
/// 只在查找、插入、删除时持锁，从不跨网络调用持锁。
#[derive(Clone, Default)]
pub struct ServiceSetTable {
    sets: Arc<RwLock<HashMap<String, Arc<ServiceSet>>>>,
}

impl ServiceSetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service_name: &str) -> Option<Arc<ServiceSet>> {
        self.sets.read().get(service_name).cloned()
    }

    /// 获取一张引用：已有存活集合时复用，否则用 `make` 新建并替换
    ///
    /// 返回集合以及是否为新建。
    pub(crate) fn acquire<F>(&self, service_name: &str, make: F) -> (Arc<ServiceSet>, bool)
    where
        F: FnOnce() -> Arc<ServiceSet>,
    {
        let mut sets = self.sets.write();
        if let Some(existing) = sets.get(service_name) {
            if existing.try_acquire() {
                return (existing.clone(), false);
            }
        }
        let set = make();
        sets.insert(service_name.to_string(), set.clone());
        (set, true)
    }

    /// 移除集合（仅当表中仍是同一个集合时）
    pub(crate) fn release(&self, set: &Arc<ServiceSet>) -> bool {
        let mut sets = self.sets.write();
        match sets.get(set.service_name()) {
            Some(current) if Arc::ptr_eq(current, set) => {
                sets.remove(set.service_name());
                true
            }
            _ => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// 所有非空缓存的快照
    pub fn snapshot(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.sets
            .read()
            .iter()
            .filter_map(|(name, set)| {
                let instances = set.snapshot();
                (!instances.is_empty()).then(|| (name.clone(), instances.as_ref().clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }

    /// 清空映射表并取消所有解析循环
    pub(crate) fn clear(&self) {
        let drained: Vec<Arc<ServiceSet>> = self.sets.write().drain().map(|(_, set)| set).collect();
        for set in drained {
            set.cancel.cancel();
        }
    }
}
