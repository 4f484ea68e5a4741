//! Retry policy
//!
//! Exponential backoff with jitter around every external invocation. The
//! error kind decides whether a failure consumes a retry at all.

use std::time::Duration;

use rand::Rng;

use crate::domain::ErrorKind;

/// Backoff and attempt-cap policy for task retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Deterministic backoff before attempt `k` (1-based):
    /// `min(base × 2^(k-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.saturating_mul(1u32 << exp);
        scaled.min(self.max_delay)
    }

    /// Backoff with ±25% jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let factor = rand::rng().random_range(0.75..=1.25);
        base.mul_f64(factor)
    }

    /// Whether a task that has made `attempts` total attempts and failed
    /// with `kind` should be retried.
    pub fn should_retry(&self, kind: ErrorKind, attempts: u32) -> bool {
        kind.is_retryable() && attempts < kind.max_attempts(self.max_retries)
    }
}
