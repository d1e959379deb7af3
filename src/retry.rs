//! # 重试策略
//!
//! 每个请求携带一份 `RetryPolicy`：单次尝试超时、最大尝试次数、超时退避倍数。
//! 默认只尝试一次（20 秒超时），宁可尽快把失败交给用户，也不静默拉长等待。

use std::time::Duration;

use crate::error::{ConfigError, RequestError};

pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    timeout: Duration,
    max_attempts: u32,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// 创建并校验重试策略。
    ///
    /// # 示例
    /// ```rust
    /// use std::time::Duration;
    /// use netqueue::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(Duration::from_millis(500), 3, 2.0)?;
    /// assert_eq!(policy.next_timeout(3), Duration::from_millis(2000));
    /// # Ok::<(), netqueue::ConfigError>(())
    /// ```
    pub fn new(timeout: Duration, max_attempts: u32, backoff_multiplier: f32) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "超时时间必须大于 0"));
        }
        if max_attempts < 1 {
            return Err(ConfigError::invalid("max_attempts", "最大尝试次数不能小于 1"));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("退避倍数必须是不小于 1.0 的有限数（当前：{}）", backoff_multiplier),
            ));
        }

        Ok(Self {
            timeout,
            max_attempts,
            backoff_multiplier,
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, ConfigError> {
        Self::new(timeout, self.max_attempts, self.backoff_multiplier)
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Result<Self, ConfigError> {
        Self::new(self.timeout, max_attempts, self.backoff_multiplier)
    }

    pub fn with_backoff(self, backoff_multiplier: f32) -> Result<Self, ConfigError> {
        Self::new(self.timeout, self.max_attempts, backoff_multiplier)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_multiplier(&self) -> f32 {
        self.backoff_multiplier
    }

    /// 第 `attempt` 次尝试（从 1 开始）的超时：`timeout * multiplier^(attempt-1)`。
    pub fn next_timeout(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = (self.backoff_multiplier as f64).powi(exponent);
        let millis = self.timeout.as_millis() as f64 * factor;

        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.round() as u64)
    }

    /// 第 `attempt` 次尝试以 `error` 失败后是否还应再试。
    pub fn should_retry(&self, attempt: u32, error: &RequestError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }
}
