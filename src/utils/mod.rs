//! 工具函数模块

use std::future::Future;
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// 为单次后端调用套上超时
///
/// `limit` 为 `None` 时不限制。超时按后端不可用处理，属于可重试错误。
pub async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await?,
        None => fut.await,
    }
}

/// 解析 endpoint URI 为 (scheme, host, port)
///
/// 缺省端口时按 scheme 推断（http=80, https=443），其余 scheme 必须显式给出端口。
pub fn parse_endpoint(endpoint: &str) -> Result<(String, String, u16)> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| RegistryError::config(format!("invalid endpoint {}: {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| RegistryError::config(format!("endpoint {} has no host", endpoint)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RegistryError::config(format!("endpoint {} has no port", endpoint)))?;
    Ok((url.scheme().to_string(), host, port))
}

/// 格式化为 Consul 的时长字符串，如 "10s"
pub fn consul_duration(secs: u64) -> String {
    format!("{}s", secs)
}
