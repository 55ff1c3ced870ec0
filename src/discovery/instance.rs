//! 服务实例定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 元数据中记录来源数据中心的键
pub const DATACENTER_METADATA_KEY: &str = "dc";

/// 服务实例
///
/// 构造后视为不可变值；更新时整体替换，不做原地修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServiceInstance {
    /// 实例 ID（唯一标识）
    pub id: String,

    /// 逻辑服务名（如 "orders"）
    pub name: String,

    /// 版本
    pub version: String,

    /// 自定义元数据
    pub metadata: HashMap<String, String>,

    /// 可达 endpoint 列表，如 `grpc://10.0.0.1:9000`
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 添加 endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// 来源数据中心（多数据中心模式下由解析器写入）
    pub fn datacenter(&self) -> Option<&str> {
        self.metadata
            .get(DATACENTER_METADATA_KEY)
            .map(String::as_str)
    }

    /// 查找指定 scheme 的 endpoint
    pub fn endpoint_for_scheme(&self, scheme: &str) -> Option<&str> {
        let prefix = format!("{}://", scheme);
        self.endpoints
            .iter()
            .find(|e| e.starts_with(&prefix))
            .map(String::as_str)
    }
}
