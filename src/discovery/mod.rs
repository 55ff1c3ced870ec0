//! 服务发现模块
//!
//! 按服务名缓存实例列表，由后台解析循环通过阻塞查询保持更新，
//! 并把变化扇出给所有监听句柄。

pub mod backend;
pub mod instance;
pub mod resolver;
pub mod service_set;
pub mod watcher;

pub use backend::{
    AgentCheck, AgentRegistration, CheckStatus, ConsulBackend, MemoryBackend, QueryOptions,
    RegistryBackend, TaggedAddress,
};
pub use instance::{DATACENTER_METADATA_KEY, ServiceInstance};
pub use resolver::{ResolveCursor, Resolver};
pub use service_set::{ServiceSet, ServiceSetTable};
pub use watcher::ServiceWatcher;
