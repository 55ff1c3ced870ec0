//! Flare Discovery
//!
//! 客户端侧的服务注册与发现：
//! - 注册服务实例，附加 TCP/TTL 健康检查，TTL 心跳失败后自动重新注册
//! - 按服务名缓存实例列表，后台阻塞查询保持更新，变化以合并通知扇出给监听者
//! - 单数据中心或多数据中心聚合解析
//! - 注册中心自带 KV 的读写与监听
//!
//! 后端默认对接 Consul agent HTTP API，也可以实现 [`RegistryBackend`] 接入其他注册中心，
//! 或在测试中使用 [`MemoryBackend`]。

pub mod config;
pub mod discovery;
pub mod error;
pub mod kv;
pub mod registry;
pub mod retry;
pub mod telemetry;
pub mod utils;

pub use config::{DatacenterMode, RegistryConfig, ServiceCheck};
pub use discovery::{
    AgentCheck, AgentRegistration, CheckStatus, ConsulBackend, DATACENTER_METADATA_KEY,
    MemoryBackend, QueryOptions, RegistryBackend, ServiceInstance, ServiceWatcher, TaggedAddress,
};
pub use error::{ErrorCategory, ErrorCode, RegistryError, Result};
pub use kv::{KvStore, KvWatcher};
pub use registry::{Discovery, KvProvider, KvWatch, Registrar, Registry, Watcher};
pub use retry::{FixedRetryPolicy, JitterRetryPolicy, RetryPolicy};
