//! 服务解析
//!
//! 把"按服务名解析实例"翻译成后端查询：单数据中心发一次查询；
//! 多数据中心对每个已知数据中心各自发阻塞查询，每个数据中心维护自己的索引，
//! 任一数据中心的索引变化都会产生新的合并结果。

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{DatacenterMode, RegistryConfig};
use crate::discovery::backend::{QueryOptions, RegistryBackend};
use crate::discovery::instance::{DATACENTER_METADATA_KEY, ServiceInstance};
use crate::error::Result;
use crate::utils::with_timeout;

/// 单个数据中心最近一次看到的结果
#[derive(Debug, Clone, Default)]
struct DatacenterView {
    index: u64,
    instances: Vec<ServiceInstance>,
}

/// 解析游标
///
/// 记录已经看到的索引（单数据中心一个，多数据中心每个数据中心一个），
/// 下一次阻塞查询从这里继续。
#[derive(Debug, Clone, Default)]
pub struct ResolveCursor {
    last_index: Option<u64>,
    datacenters: BTreeMap<String, DatacenterView>,
}

impl ResolveCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 单数据中心模式下最近的索引，尚未解析过为 0
    pub fn index(&self) -> u64 {
        self.last_index.unwrap_or(0)
    }

    /// 某数据中心最近的索引，尚未见过为 0
    pub fn datacenter_index(&self, datacenter: &str) -> u64 {
        self.datacenters.get(datacenter).map_or(0, |view| view.index)
    }

    fn has_seen(&self, datacenter: &str) -> bool {
        self.datacenters.contains_key(datacenter)
    }

    /// 记录某数据中心的结果，返回是否有变化
    fn observe(&mut self, datacenter: &str, index: u64, instances: Vec<ServiceInstance>) -> bool {
        match self.datacenters.get_mut(datacenter) {
            Some(view) if view.index == index => false,
            Some(view) => {
                view.index = index;
                view.instances = instances;
                true
            }
            None => {
                self.datacenters
                    .insert(datacenter.to_string(), DatacenterView { index, instances });
                true
            }
        }
    }

    /// 丢弃已不存在的数据中心，返回是否丢弃了任何一个
    fn retain_datacenters(&mut self, datacenters: &[String]) -> bool {
        let before = self.datacenters.len();
        self.datacenters
            .retain(|dc, _| datacenters.iter().any(|known| known == dc));
        self.datacenters.len() != before
    }

    /// 合并各数据中心的实例，未带数据中心标记的实例写入来源数据中心
    fn merged(&self) -> Vec<ServiceInstance> {
        self.datacenters
            .iter()
            .flat_map(|(dc, view)| {
                view.instances.iter().cloned().map(move |mut instance| {
                    instance
                        .metadata
                        .entry(DATACENTER_METADATA_KEY.to_string())
                        .or_insert_with(|| dc.clone());
                    instance
                })
            })
            .collect()
    }
}

/// 服务解析器
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn RegistryBackend>,
    mode: DatacenterMode,
    wait_time: Duration,
    call_timeout: Option<Duration>,
    blocking_timeout: Option<Duration>,
}

impl Resolver {
    pub fn new(backend: Arc<dyn RegistryBackend>, config: &RegistryConfig) -> Self {
        Self {
            backend,
            mode: config.datacenter_mode,
            wait_time: config.wait_duration(),
            call_timeout: config.call_timeout(),
            blocking_timeout: config.blocking_call_timeout(),
        }
    }

    pub fn mode(&self) -> DatacenterMode {
        self.mode
    }

    /// 立即解析一次服务实例（不阻塞）
    pub async fn resolve(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let mut cursor = ResolveCursor::new();
        Ok(self.poll(service, &mut cursor).await?.unwrap_or_default())
    }

    /// 从游标继续解析
    ///
    /// 有索引变化时返回最新的（合并后的）实例列表，等待窗口内无变化返回 `None`。
    /// 多数据中心模式下单个数据中心失败只记录告警并跳过，全部失败才返回错误。
    pub async fn poll(
        &self,
        service: &str,
        cursor: &mut ResolveCursor,
    ) -> Result<Option<Vec<ServiceInstance>>> {
        match self.mode {
            DatacenterMode::Single => {
                let query = QueryOptions::blocking(cursor.index(), self.wait_time);
                let (instances, index) = self.query(service, query).await?;
                let changed = cursor.last_index != Some(index);
                cursor.last_index = Some(index);
                Ok(changed.then_some(instances))
            }
            DatacenterMode::Multi => self.poll_datacenters(service, cursor).await,
        }
    }

    async fn query(
        &self,
        service: &str,
        query: QueryOptions,
    ) -> Result<(Vec<ServiceInstance>, u64)> {
        let limit = if query.wait_index > 0 {
            self.blocking_timeout
        } else {
            self.call_timeout
        };
        with_timeout(limit, self.backend.list_service_instances(service, &query)).await
    }

    async fn poll_datacenters(
        &self,
        service: &str,
        cursor: &mut ResolveCursor,
    ) -> Result<Option<Vec<ServiceInstance>>> {
        let datacenters =
            with_timeout(self.call_timeout, self.backend.list_datacenters()).await?;
        let mut changed = cursor.retain_datacenters(&datacenters);

        // 未见过的数据中心立即查询，其余按各自的索引阻塞
        let mut unseen = 0usize;
        let mut pending = FuturesUnordered::new();
        for dc in &datacenters {
            let seen = cursor.has_seen(dc);
            if !seen {
                unseen += 1;
            }
            let query =
                QueryOptions::blocking(cursor.datacenter_index(dc), self.wait_time).in_datacenter(dc);
            pending.push(async move { (dc.as_str(), seen, self.query(service, query).await) });
        }

        let mut failed = 0usize;
        let mut last_error = None;
        while let Some((dc, seen, result)) = pending.next().await {
            if !seen {
                unseen -= 1;
            }
            match result {
                Ok((instances, index)) => changed |= cursor.observe(dc, index, instances),
                Err(e) => {
                    warn!(
                        service = %service,
                        datacenter = %dc,
                        error = %e,
                        "Failed to query datacenter, skipping"
                    );
                    failed += 1;
                    last_error = Some(e);
                }
            }
            // 新数据中心都已返回时，任一变化即可结束，不等其余数据中心的等待窗口
            if changed && unseen == 0 {
                break;
            }
        }
        drop(pending);

        if failed == datacenters.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(changed.then(|| cursor.merged()))
    }
}
