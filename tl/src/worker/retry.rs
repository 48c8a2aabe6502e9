//! Retry classification and exponential backoff for worker exits

use std::time::Duration;

use tracing::debug;

use crate::config::RetryConfig;

/// How a worker exit code should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Transient condition (network, rate limit, timeout); worth another attempt
    Retryable,
    /// Anything else; surfaced immediately
    Fatal,
}

/// Bookkeeping for one attempt inside a single dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Sleep taken before this attempt (zero for the first)
    pub delay: Duration,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            retryable_exit_codes: config.retryable_exit_codes.clone(),
        }
    }

    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        debug!(retry, ?delay, "RetryPolicy::delay_for: called");
        delay
    }

    pub fn classify(&self, exit_code: i32) -> ExitClass {
        if exit_code == 0 {
            ExitClass::Success
        } else if self.retryable_exit_codes.contains(&exit_code) {
            ExitClass::Retryable
        } else {
            ExitClass::Fatal
        }
    }

    pub fn is_retryable(&self, exit_code: i32) -> bool {
        self.classify(exit_code) == ExitClass::Retryable
    }
}
