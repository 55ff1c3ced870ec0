//! 注册中心统一错误类型

use super::code::ErrorCode;
use std::time::Duration;
use thiserror::Error;

/// 注册中心统一错误类型
///
/// `Cancelled` 与其它失败始终可区分，调用方据此判断"是我停止的"还是"失败了"。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// 传输/连接失败、5xx、调用超时
    #[error("registry backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 后端拒绝注册（校验失败）
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    /// 缓存与直接查询都没有得到实例
    #[error("service {0} not resolved in registry")]
    ServiceNotResolved(String),

    /// 首次解析超出创建时限
    #[error("watcher for service {service} not ready within {timeout:?}")]
    WatcherCreateTimeout { service: String, timeout: Duration },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// 后端对非 KV 资源（服务、检查）返回 404
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// 调用方或进程关闭导致的取消
    #[error("operation cancelled")]
    Cancelled,
}

impl RegistryError {
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        RegistryError::BackendUnavailable(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        RegistryError::RegistrationRejected(reason.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        RegistryError::NotFound(resource.into())
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        RegistryError::InvalidResponse(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        RegistryError::Config(reason.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            RegistryError::RegistrationRejected(_) => ErrorCode::RegistrationRejected,
            RegistryError::ServiceNotResolved(_) => ErrorCode::ServiceNotResolved,
            RegistryError::WatcherCreateTimeout { .. } => ErrorCode::WatcherCreateTimeout,
            RegistryError::KeyNotFound(_) => ErrorCode::KeyNotFound,
            RegistryError::NotFound(_) => ErrorCode::ResourceNotFound,
            RegistryError::InvalidResponse(_) => ErrorCode::InvalidResponse,
            RegistryError::Config(_) => ErrorCode::ConfigurationError,
            RegistryError::Cancelled => ErrorCode::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RegistryError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::NotFound(_) | RegistryError::KeyNotFound(_)
        )
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::ServiceNotResolved("orders".to_string());
        assert_eq!(err.to_string(), "service orders not resolved in registry");

        let err = RegistryError::WatcherCreateTimeout {
            service: "orders".to_string(),
            timeout: Duration::from_millis(200),
        };
        assert_eq!(
            err.to_string(),
            "watcher for service orders not ready within 200ms"
        );

        assert_eq!(RegistryError::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn test_classification() {
        assert!(RegistryError::Cancelled.is_cancelled());
        assert!(!RegistryError::Cancelled.is_retryable());
        assert!(RegistryError::not_found("service:a").is_not_found());
        assert!(RegistryError::KeyNotFound("k".into()).is_not_found());
        assert!(RegistryError::backend_unavailable("down").is_retryable());
        assert_eq!(
            RegistryError::rejected("bad").code(),
            ErrorCode::RegistrationRejected
        );
    }
}
