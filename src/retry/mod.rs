//! 重试策略模块
//!
//! 后台循环（解析循环、心跳重新注册）的退避策略。后台循环吞掉瞬时错误并持续重试，
//! 只有取消才会终止。

pub mod fixed;
pub mod jitter;

pub use fixed::FixedRetryPolicy;
pub use jitter::JitterRetryPolicy;

use std::time::Duration;

use crate::error::RegistryError;

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    /// `attempt` 从 1 开始计数
    fn should_retry(&self, attempt: usize, error: &RegistryError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}
