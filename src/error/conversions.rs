//! 错误类型转换实现
//!
//! 提供各种错误类型之间的转换

use super::RegistryError;
use std::io;

impl From<io::Error> for RegistryError {
    fn from(err: io::Error) -> Self {
        RegistryError::config(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::invalid_response(format!("JSON decode error: {}", err))
    }
}

impl From<toml::de::Error> for RegistryError {
    fn from(err: toml::de::Error) -> Self {
        RegistryError::config(format!("TOML parse error: {}", err))
    }
}

impl From<base64::DecodeError> for RegistryError {
    fn from(err: base64::DecodeError) -> Self {
        RegistryError::invalid_response(format!("base64 decode error: {}", err))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        // 连接失败、超时等传输层错误统一视为后端不可用
        if err.is_decode() {
            return RegistryError::invalid_response(err.to_string());
        }
        if err.is_builder() {
            return RegistryError::config(err.to_string());
        }
        RegistryError::backend_unavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RegistryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RegistryError::backend_unavailable(format!("request timed out: {}", err))
    }
}
