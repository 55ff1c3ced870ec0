//! 内存注册中心后端
//!
//! 进程内实现，带 Consul 阻塞查询语义：查询的 wait index 等于当前索引时阻塞，
//! 直到索引变化或等待窗口结束。服务在每个数据中心有独立的索引。用于测试和本地开发。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use super::{AgentRegistration, CheckStatus, QueryOptions, RegistryBackend};
use crate::discovery::instance::ServiceInstance;
use crate::error::{RegistryError, Result};

const DEFAULT_DATACENTER: &str = "dc1";

/// 某服务在单个数据中心内的实例，每个数据中心有独立的索引
struct DatacenterRecord {
    index: u64,
    instances: Vec<ServiceInstance>,
}

struct MemoryState {
    index: u64,
    datacenters: Vec<String>,
    services: HashMap<String, HashMap<String, DatacenterRecord>>,
    registrations: HashMap<String, AgentRegistration>,
    checks: HashMap<String, CheckStatus>,
    kv: HashMap<String, Vec<u8>>,
    kv_index: HashMap<String, u64>,
    unavailable: bool,
    unavailable_datacenters: HashSet<String>,
    reject_registrations: bool,
    failing_ttl_updates: usize,
    ttl_delay: Duration,
    list_delay: Duration,
    list_calls: HashMap<String, usize>,
    ttl_updates: usize,
    register_calls: usize,
    deregistrations: Vec<String>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            index: 1,
            datacenters: vec![DEFAULT_DATACENTER.to_string()],
            services: HashMap::new(),
            registrations: HashMap::new(),
            checks: HashMap::new(),
            kv: HashMap::new(),
            kv_index: HashMap::new(),
            unavailable: false,
            unavailable_datacenters: HashSet::new(),
            reject_registrations: false,
            failing_ttl_updates: 0,
            ttl_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
            list_calls: HashMap::new(),
            ttl_updates: 0,
            register_calls: 0,
            deregistrations: Vec::new(),
        }
    }
}

impl MemoryState {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(RegistryError::backend_unavailable("memory backend offline"));
        }
        Ok(())
    }

    fn ensure_datacenter_available(&self, datacenter: &str) -> Result<()> {
        self.ensure_available()?;
        if self.unavailable_datacenters.contains(datacenter) {
            return Err(RegistryError::backend_unavailable(format!(
                "datacenter {} unreachable",
                datacenter
            )));
        }
        Ok(())
    }

    fn service_index(&self, name: &str, datacenter: &str) -> u64 {
        self.services
            .get(name)
            .and_then(|per_dc| per_dc.get(datacenter))
            .map(|r| r.index)
            .unwrap_or(self.index)
    }

    fn store(&mut self, datacenter: &str, service: &str, index: u64, instances: Vec<ServiceInstance>) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(datacenter.to_string(), DatacenterRecord { index, instances });
    }

    fn key_index(&self, key: &str) -> u64 {
        self.kv_index.get(key).copied().unwrap_or(self.index)
    }
}

/// 在途 TTL 更新计数，future 被丢弃时同样递减
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 内存注册中心后端
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    index_tx: watch::Sender<u64>,
    ttl_in_flight: AtomicUsize,
    ttl_peak: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(1);
        Self {
            state: Mutex::new(MemoryState::default()),
            index_tx,
            ttl_in_flight: AtomicUsize::new(0),
            ttl_peak: AtomicUsize::new(0),
        }
    }

    fn notify(&self, index: u64) {
        self.index_tx.send_replace(index);
    }

    /// 发布默认数据中心内某服务的实例列表，索引自增
    pub fn publish(&self, service: &str, instances: Vec<ServiceInstance>) -> u64 {
        self.publish_in(DEFAULT_DATACENTER, service, instances)
    }

    /// 发布指定数据中心内某服务的实例列表，索引自增
    pub fn publish_in(&self, datacenter: &str, service: &str, instances: Vec<ServiceInstance>) -> u64 {
        let index = {
            let mut state = self.state.lock();
            let index = state.bump();
            state.store(datacenter, service, index, instances);
            index
        };
        self.notify(index);
        index
    }

    /// 以显式索引发布到默认数据中心（索引不变时阻塞查询不会返回）
    pub fn publish_at(&self, service: &str, index: u64, instances: Vec<ServiceInstance>) {
        self.publish_in_at(DEFAULT_DATACENTER, service, index, instances);
    }

    /// 以显式索引发布到指定数据中心，各数据中心的索引互不相关
    pub fn publish_in_at(
        &self,
        datacenter: &str,
        service: &str,
        index: u64,
        instances: Vec<ServiceInstance>,
    ) {
        {
            let mut state = self.state.lock();
            state.index = state.index.max(index);
            state.store(datacenter, service, index, instances);
        }
        self.notify(index);
    }

    pub fn set_datacenters<I, S>(&self, datacenters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().datacenters = datacenters.into_iter().map(Into::into).collect();
    }

    /// 模拟后端整体不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// 模拟单个数据中心不可达
    pub fn set_datacenter_unavailable(&self, datacenter: &str, unavailable: bool) {
        let mut state = self.state.lock();
        if unavailable {
            state.unavailable_datacenters.insert(datacenter.to_string());
        } else {
            state.unavailable_datacenters.remove(datacenter);
        }
    }

    /// 模拟后端拒绝注册
    pub fn set_reject_registrations(&self, reject: bool) {
        self.state.lock().reject_registrations = reject;
    }

    /// 让接下来的 n 次 TTL 更新失败
    pub fn fail_next_ttl_updates(&self, n: usize) {
        self.state.lock().failing_ttl_updates = n;
    }

    /// 为每次 TTL 更新增加延迟
    pub fn set_ttl_delay(&self, delay: Duration) {
        self.state.lock().ttl_delay = delay;
    }

    /// 为每次实例列表查询增加延迟（模拟慢后端）
    pub fn set_list_delay(&self, delay: Duration) {
        self.state.lock().list_delay = delay;
    }

    /// 删除检查（模拟 agent 重启丢失检查）
    pub fn remove_check(&self, check_id: &str) {
        self.state.lock().checks.remove(check_id);
    }

    pub fn check_status(&self, check_id: &str) -> Option<CheckStatus> {
        self.state.lock().checks.get(check_id).copied()
    }

    pub fn registration(&self, service_id: &str) -> Option<AgentRegistration> {
        self.state.lock().registrations.get(service_id).cloned()
    }

    /// 成功与失败的注册调用总数
    pub fn register_calls(&self) -> usize {
        self.state.lock().register_calls
    }

    pub fn deregistrations(&self) -> Vec<String> {
        self.state.lock().deregistrations.clone()
    }

    /// 某服务的列表查询次数
    pub fn list_calls(&self, service: &str) -> usize {
        self.state
            .lock()
            .list_calls
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    pub fn ttl_updates(&self) -> usize {
        self.state.lock().ttl_updates
    }

    /// 同时在途的 TTL 更新数峰值
    pub fn peak_concurrent_ttl_updates(&self) -> usize {
        self.ttl_peak.load(Ordering::SeqCst)
    }

    /// 阻塞直到 `current` 返回的索引不同于 `wait_index` 或等待窗口结束
    async fn block_while<F>(&self, wait_index: u64, wait_time: Duration, current: F)
    where
        F: Fn(&MemoryState) -> u64,
    {
        if wait_index == 0 || wait_time.is_zero() {
            return;
        }
        let mut rx = self.index_tx.subscribe();
        let deadline = tokio::time::Instant::now() + wait_time;
        loop {
            let index = current(&self.state.lock());
            if index != wait_index {
                return;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return,
            }
        }
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn register_service(&self, registration: &AgentRegistration) -> Result<()> {
        let mut state = self.state.lock();
        state.register_calls += 1;
        state.ensure_available()?;
        if state.reject_registrations || registration.name.is_empty() {
            return Err(RegistryError::rejected(format!(
                "invalid registration {}",
                registration.id
            )));
        }
        for check in &registration.checks {
            if let Some(id) = &check.check_id {
                state.checks.insert(id.clone(), CheckStatus::Critical);
            }
        }
        state
            .registrations
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.deregistrations.push(service_id.to_string());
        match state.registrations.remove(service_id) {
            Some(registration) => {
                for check in &registration.checks {
                    if let Some(id) = &check.check_id {
                        state.checks.remove(id);
                    }
                }
                Ok(())
            }
            None => Err(RegistryError::not_found(format!("service {}", service_id))),
        }
    }

    async fn list_service_instances(
        &self,
        service_name: &str,
        query: &QueryOptions,
    ) -> Result<(Vec<ServiceInstance>, u64)> {
        let (datacenter, delay) = {
            let mut state = self.state.lock();
            *state
                .list_calls
                .entry(service_name.to_string())
                .or_insert(0) += 1;
            let datacenter = query
                .datacenter
                .clone()
                .or_else(|| state.datacenters.first().cloned())
                .unwrap_or_else(|| DEFAULT_DATACENTER.to_string());
            state.ensure_datacenter_available(&datacenter)?;
            (datacenter, state.list_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.block_while(query.wait_index, query.wait_time, |s| {
            s.service_index(service_name, &datacenter)
        })
        .await;

        let state = self.state.lock();
        state.ensure_datacenter_available(&datacenter)?;
        let instances = state
            .services
            .get(service_name)
            .and_then(|per_dc| per_dc.get(&datacenter))
            .map(|r| r.instances.clone())
            .unwrap_or_default();
        Ok((instances, state.service_index(service_name, &datacenter)))
    }

    async fn list_datacenters(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        state.ensure_available()?;
        Ok(state.datacenters.clone())
    }

    async fn update_ttl_check(
        &self,
        check_id: &str,
        status: CheckStatus,
        _output: &str,
    ) -> Result<()> {
        let current = self.ttl_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.ttl_in_flight);
        self.ttl_peak.fetch_max(current, Ordering::SeqCst);

        let delay = self.state.lock().ttl_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.ttl_updates += 1;
        state.ensure_available()?;
        if state.failing_ttl_updates > 0 {
            state.failing_ttl_updates -= 1;
            return Err(RegistryError::backend_unavailable("injected TTL failure"));
        }
        match state.checks.get_mut(check_id) {
            Some(current) => {
                *current = status;
                Ok(())
            }
            None => Err(RegistryError::not_found(format!("check {}", check_id))),
        }
    }

    async fn kv_get(&self, key: &str, query: &QueryOptions) -> Result<(Option<Vec<u8>>, u64)> {
        self.state.lock().ensure_available()?;
        self.block_while(query.wait_index, query.wait_time, |s| s.key_index(key))
            .await;
        let state = self.state.lock();
        state.ensure_available()?;
        Ok((state.kv.get(key).cloned(), state.key_index(key)))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let index = {
            let mut state = self.state.lock();
            state.ensure_available()?;
            let index = state.bump();
            state.kv.insert(key.to_string(), value.to_vec());
            state.kv_index.insert(key.to_string(), index);
            index
        };
        self.notify(index);
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let index = {
            let mut state = self.state.lock();
            state.ensure_available()?;
            if state.kv.remove(key).is_none() {
                return Ok(());
            }
            let index = state.bump();
            state.kv_index.insert(key.to_string(), index);
            index
        };
        self.notify(index);
        Ok(())
    }
}
