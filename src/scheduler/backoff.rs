use crate::config::RetryPolicy;
use std::time::Duration;

/// Exponential retry delay: `backoff_ms`, doubled after every consecutive
/// failure, capped at `max_backoff_ms`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: Duration::from_millis(policy.backoff_ms),
            max: Duration::from_millis(policy.max_backoff_ms.max(policy.backoff_ms)),
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.consecutive_failures.min(31);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.base
            .checked_mul(1u32 << shift)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
