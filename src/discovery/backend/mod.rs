//! 注册中心后端抽象和实现

pub mod consul;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::discovery::instance::ServiceInstance;
use crate::error::Result;

pub use consul::ConsulBackend;
pub use memory::MemoryBackend;

/// 注册中心后端 trait
///
/// 对远端注册中心请求/响应 API 的薄封装，所有调用在一次请求（或一次长轮询）内返回。
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// 注册服务（agent 级注册）
    async fn register_service(&self, registration: &AgentRegistration) -> Result<()>;

    /// 注销服务，服务不存在时返回 `RegistryError::NotFound`
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// 列出服务实例
    ///
    /// 当 `query.wait_index` 等于当前索引时阻塞，最长 `query.wait_time`。
    /// 返回实例列表和新的索引。
    async fn list_service_instances(
        &self,
        service_name: &str,
        query: &QueryOptions,
    ) -> Result<(Vec<ServiceInstance>, u64)>;

    /// 列出已知数据中心
    async fn list_datacenters(&self) -> Result<Vec<String>>;

    /// 更新 TTL 检查状态，检查不存在时返回 `RegistryError::NotFound`
    async fn update_ttl_check(&self, check_id: &str, status: CheckStatus, output: &str)
    -> Result<()>;

    /// 读取 KV，键不存在时返回 `None` 以及当前索引
    async fn kv_get(&self, key: &str, query: &QueryOptions) -> Result<(Option<Vec<u8>>, u64)>;

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn kv_delete(&self, key: &str) -> Result<()>;
}

/// 查询选项
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// 上次观察到的索引，0 表示不阻塞
    pub wait_index: u64,
    /// 服务端阻塞等待窗口
    pub wait_time: Duration,
    /// 目标数据中心，`None` 表示 agent 所在数据中心
    pub datacenter: Option<String>,
    /// 只返回健康实例
    pub healthy_only: bool,
}

impl QueryOptions {
    /// 非阻塞查询
    pub fn immediate() -> Self {
        Self {
            healthy_only: true,
            ..Default::default()
        }
    }

    /// 阻塞查询
    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            wait_index,
            wait_time,
            datacenter: None,
            healthy_only: true,
        }
    }

    pub fn in_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }
}

/// 检查状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
        }
    }
}

/// agent 服务注册载荷
///
/// 注册成功后由心跳会话保存，用于失败后原样重新注册。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AgentRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub address: String,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub port: u16,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub tagged_addresses: HashMap<String, TaggedAddress>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub checks: Vec<AgentCheck>,
}

impl AgentRegistration {
    /// TTL 检查 ID（如果注册中带有 TTL 检查）
    pub fn ttl_check_id(&self) -> Option<&str> {
        self.checks
            .iter()
            .find(|c| c.ttl.is_some())
            .and_then(|c| c.check_id.as_deref())
    }
}

/// 带标签的地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaggedAddress {
    pub address: String,
    pub port: u16,
}

/// agent 服务检查
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AgentCheck {
    #[serde(rename = "CheckID", skip_serializing_if = "Option::is_none", default)]
    pub check_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none", default)]
    pub tcp: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none", default)]
    pub http: Option<String>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none", default)]
    pub ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deregister_critical_service_after: Option<String>,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}
