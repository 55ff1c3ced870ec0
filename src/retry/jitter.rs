use super::RetryPolicy;
use crate::error::RegistryError;
use rand::Rng;
use std::time::Duration;

/// 随机抖动重试策略
///
/// 每次退避时长在 `[0, max_jitter)` 内均匀随机，避免大量实例同时重新注册。
#[derive(Debug, Clone)]
pub struct JitterRetryPolicy {
    max_attempts: usize,
    max_jitter: Duration,
}

impl JitterRetryPolicy {
    pub fn new(max_attempts: usize, max_jitter: Duration) -> Self {
        Self {
            max_attempts,
            max_jitter,
        }
    }

    pub fn unbounded(max_jitter: Duration) -> Self {
        Self::new(usize::MAX, max_jitter)
    }
}

impl RetryPolicy for JitterRetryPolicy {
    fn should_retry(&self, attempt: usize, error: &RegistryError) -> bool {
        attempt < self.max_attempts && !error.is_cancelled()
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
