//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 注册中心后端相关错误
/// - 2000-2999: 服务注册相关错误
/// - 3000-3999: 服务发现相关错误
/// - 4000-4999: KV 相关错误
/// - 8000-8999: 序列化相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 后端相关错误 (1000-1999)
    // ============================================================
    BackendUnavailable = 1000,
    ResourceNotFound = 1001,

    // ============================================================
    // 服务注册相关错误 (2000-2999)
    // ============================================================
    RegistrationRejected = 2000,

    // ============================================================
    // 服务发现相关错误 (3000-3999)
    // ============================================================
    ServiceNotResolved = 3000,
    WatcherCreateTimeout = 3001,

    // ============================================================
    // KV 相关错误 (4000-4999)
    // ============================================================
    KeyNotFound = 4000,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    InvalidResponse = 8000,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    ConfigurationError = 9000,
    Cancelled = 9001,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 从数字值创建错误代码
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::BackendUnavailable),
            1001 => Some(ErrorCode::ResourceNotFound),
            2000 => Some(ErrorCode::RegistrationRejected),
            3000 => Some(ErrorCode::ServiceNotResolved),
            3001 => Some(ErrorCode::WatcherCreateTimeout),
            4000 => Some(ErrorCode::KeyNotFound),
            8000 => Some(ErrorCode::InvalidResponse),
            9000 => Some(ErrorCode::ConfigurationError),
            9001 => Some(ErrorCode::Cancelled),
            _ => None,
        }
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::RegistrationRejected => "REGISTRATION_REJECTED",
            ErrorCode::ServiceNotResolved => "SERVICE_NOT_RESOLVED",
            ErrorCode::WatcherCreateTimeout => "WATCHER_CREATE_TIMEOUT",
            ErrorCode::KeyNotFound => "KEY_NOT_FOUND",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Backend,
            2000..=2999 => ErrorCategory::Registration,
            3000..=3999 => ErrorCategory::Discovery,
            4000..=4999 => ErrorCategory::Kv,
            8000..=8999 => ErrorCategory::Serialization,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 后台循环（解析循环、心跳）只对可重试错误做退避重试以外的处理
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::BackendUnavailable
                | ErrorCode::ResourceNotFound
                | ErrorCode::InvalidResponse
                | ErrorCode::WatcherCreateTimeout
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Backend,
    Registration,
    Discovery,
    Kv,
    Serialization,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Backend => write!(f, "BACKEND"),
            ErrorCategory::Registration => write!(f, "REGISTRATION"),
            ErrorCategory::Discovery => write!(f, "DISCOVERY"),
            ErrorCategory::Kv => write!(f, "KV"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip_and_category() {
        for code in [
            ErrorCode::BackendUnavailable,
            ErrorCode::RegistrationRejected,
            ErrorCode::ServiceNotResolved,
            ErrorCode::WatcherCreateTimeout,
            ErrorCode::KeyNotFound,
            ErrorCode::Cancelled,
        ] {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), Some(code));
        }
        assert_eq!(ErrorCode::KeyNotFound.category(), ErrorCategory::Kv);
        assert_eq!(ErrorCode::Cancelled.category(), ErrorCategory::General);
        assert_eq!(ErrorCode::from_u32(42), None);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCode::BackendUnavailable.is_retryable());
        assert!(!ErrorCode::Cancelled.is_retryable());
        assert!(!ErrorCode::RegistrationRejected.is_retryable());
    }
}
