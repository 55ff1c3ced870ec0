//! 服务注册发现 Trait 定义

use async_trait::async_trait;

use crate::discovery::instance::ServiceInstance;
use crate::error::Result;

/// 服务注册 Trait
#[async_trait]
pub trait Registrar: Send + Sync {
    /// 注册服务实例
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// 注销服务实例（不存在时视为成功）
    async fn deregister(&self, service_id: &str) -> Result<()>;
}

/// 服务发现 Trait
#[async_trait]
pub trait Discovery: Send + Sync {
    /// 获取服务实例（时间点快照）
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// 获取服务监听句柄
    async fn get_watcher(&self, service_name: &str) -> Result<Box<dyn Watcher>>;
}

/// 服务监听 Trait
#[async_trait]
pub trait Watcher: Send + Sync {
    /// 等待下一次实例变化
    async fn next(&self) -> Result<Vec<ServiceInstance>>;

    /// 停止监听（幂等）
    fn stop(&self) -> Result<()>;
}

/// KV 存储 Trait
#[async_trait]
pub trait KvProvider: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 读取键值，键不存在时返回 `RegistryError::KeyNotFound`
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 监听单个键
    async fn watch(&self, key: &str) -> Result<Box<dyn KvWatch>>;
}

/// KV 监听 Trait
#[async_trait]
pub trait KvWatch: Send + Sync {
    /// 等待键变化：`Some` 为新值，`None` 表示键已删除
    async fn next(&self) -> Result<Option<Vec<u8>>>;

    fn stop(&self) -> Result<()>;
}
