//! Backoff policy for failed stage attempts.

use std::time::Duration;

use crate::config::RetryConfig;

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Nack and let the bus redeliver after `delay`.
    Retry { delay: Duration },
    /// Out of retries; the delivery is acknowledged and dropped.
    Exhausted,
    /// The stage was completed or skipped in the meantime; nothing to retry.
    Settled,
}

/// Exponential backoff: `min(base * 2^(n - 1), max)` for the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decides based on the retry count already recorded for the stage.
    pub fn decide(&self, retry_count: u32) -> FailureDecision {
        if retry_count >= self.max_retries {
            FailureDecision::Exhausted
        } else {
            FailureDecision::Retry {
                delay: self.delay_for(retry_count),
            }
        }
    }
}
