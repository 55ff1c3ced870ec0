//! 注册中心客户端配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// 数据中心模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatacenterMode {
    /// 只查询本地数据中心
    #[default]
    Single,
    /// 查询所有已知数据中心并合并结果
    Multi,
}

impl std::str::FromStr for DatacenterMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "single_dc" | "local" => Ok(DatacenterMode::Single),
            "multi" | "multi_dc" | "all" => Ok(DatacenterMode::Multi),
            _ => Err(format!("Unknown datacenter mode: {}", s)),
        }
    }
}

/// 用户自定义健康检查（附加到每次注册）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ServiceCheck {
    pub check_id: Option<String>,
    pub name: Option<String>,
    /// HTTP 检查地址
    pub http: Option<String>,
    /// TCP 检查地址（host:port）
    pub tcp: Option<String>,
    /// 检查间隔，如 "10s"
    pub interval: Option<String>,
    pub timeout: Option<String>,
}

/// 注册中心客户端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consul agent 地址
    pub address: String,

    /// ACL token
    pub token: Option<String>,

    /// 是否为每个 endpoint 附加 TCP 健康检查
    pub health_check: bool,

    /// 是否启用 TTL 心跳
    pub heartbeat: bool,

    /// 健康检查间隔（秒），同时是心跳间隔；TTL 为其 2 倍
    pub health_check_interval: u64,

    /// 检查持续 critical 多久后由后端自动注销（秒）
    pub deregister_critical_service_after: u64,

    /// 单次后端调用超时（秒），0 表示不限制
    pub timeout: u64,

    /// 阻塞查询服务端等待窗口（秒）
    pub wait_time: u64,

    /// 数据中心模式
    pub datacenter_mode: DatacenterMode,

    /// 追加到每次注册的静态标签
    pub tags: Vec<String>,

    /// 追加到每次注册的自定义检查
    pub service_checks: Vec<ServiceCheck>,

    /// 首个 watcher 等待首次解析的时限（毫秒），0 表示不限制
    pub watcher_create_timeout_ms: u64,

    /// 解析循环轮询间隔（毫秒）
    pub resolve_interval_ms: u64,

    /// 解析失败后的退避时间（毫秒）
    pub resolve_retry_backoff_ms: u64,

    /// 心跳失败后重新注册的随机退避上限（毫秒）
    pub heartbeat_max_jitter_ms: u64,

    /// 重新注册连续失败时，每 N 次记录一次日志
    pub heartbeat_log_every: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            health_check: true,
            heartbeat: true,
            health_check_interval: 10,
            deregister_critical_service_after: 600,
            timeout: 10,
            wait_time: 55,
            datacenter_mode: DatacenterMode::Single,
            tags: Vec::new(),
            service_checks: Vec::new(),
            watcher_create_timeout_ms: 0,
            resolve_interval_ms: 1000,
            resolve_retry_backoff_ms: 1000,
            heartbeat_max_jitter_ms: 5000,
            heartbeat_log_every: 10,
        }
    }
}

impl RegistryConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 应用 Consul 标准环境变量（`CONSUL_HTTP_ADDR`、`CONSUL_HTTP_TOKEN`）
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("CONSUL_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.address = normalize_address(addr.trim());
            }
        }
        if let Ok(token) = std::env::var("CONSUL_HTTP_TOKEN") {
            if !token.trim().is_empty() {
                self.token = Some(token.trim().to_string());
            }
        }
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(RegistryError::config("registry address must not be empty"));
        }
        if self.heartbeat && self.health_check_interval == 0 {
            return Err(RegistryError::config(
                "health_check_interval must be positive when heartbeat is enabled",
            ));
        }
        if self.resolve_interval_ms == 0 {
            return Err(RegistryError::config("resolve_interval_ms must be positive"));
        }
        Ok(())
    }

    /// 设置 agent 地址
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = normalize_address(&address.into());
        self
    }

    /// 设置 ACL token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// 启用/禁用 TCP 健康检查
    pub fn with_health_check(mut self, enable: bool) -> Self {
        self.health_check = enable;
        self
    }

    /// 启用/禁用 TTL 心跳
    pub fn with_heartbeat(mut self, enable: bool) -> Self {
        self.heartbeat = enable;
        self
    }

    /// 设置健康检查间隔（秒）
    pub fn with_health_check_interval(mut self, secs: u64) -> Self {
        self.health_check_interval = secs;
        self
    }

    /// 设置 critical 后自动注销的时间（秒）
    pub fn with_deregister_critical_service_after(mut self, secs: u64) -> Self {
        self.deregister_critical_service_after = secs;
        self
    }

    /// 设置单次调用超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs();
        self
    }

    /// 设置阻塞查询等待窗口
    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait.as_secs();
        self
    }

    /// 设置数据中心模式
    pub fn with_datacenter_mode(mut self, mode: DatacenterMode) -> Self {
        self.datacenter_mode = mode;
        self
    }

    /// 追加静态标签
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// 追加自定义检查
    pub fn with_service_check(mut self, check: ServiceCheck) -> Self {
        self.service_checks.push(check);
        self
    }

    /// 设置 watcher 创建时限
    pub fn with_watcher_create_timeout(mut self, timeout: Duration) -> Self {
        self.watcher_create_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置解析循环轮询间隔
    pub fn with_resolve_interval(mut self, interval: Duration) -> Self {
        self.resolve_interval_ms = interval.as_millis() as u64;
        self
    }

    /// 设置解析失败退避
    pub fn with_resolve_retry_backoff(mut self, backoff: Duration) -> Self {
        self.resolve_retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// 设置重新注册随机退避上限
    pub fn with_heartbeat_max_jitter(mut self, jitter: Duration) -> Self {
        self.heartbeat_max_jitter_ms = jitter.as_millis() as u64;
        self
    }

    /// 单次调用超时，`None` 表示不限制
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(self.wait_time)
    }

    /// 阻塞查询的客户端时限：等待窗口加上单次调用超时
    pub fn blocking_call_timeout(&self) -> Option<Duration> {
        self.call_timeout().map(|t| t + self.wait_duration())
    }

    pub fn watcher_create_timeout(&self) -> Option<Duration> {
        (self.watcher_create_timeout_ms > 0)
            .then(|| Duration::from_millis(self.watcher_create_timeout_ms))
    }

    /// 解析循环间隔，至少 1 毫秒
    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms.max(1))
    }

    pub fn resolve_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_retry_backoff_ms)
    }

    /// 心跳间隔，至少 1 秒
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval.max(1))
    }

    pub fn heartbeat_max_jitter(&self) -> Duration {
        Duration::from_millis(self.heartbeat_max_jitter_ms)
    }
}

/// 补全 scheme，`127.0.0.1:8500` -> `http://127.0.0.1:8500`
pub(crate) fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}
