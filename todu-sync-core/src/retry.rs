//! Retry cap and backoff schedule for transient failures.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, capped in both delay and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an edit stalls until force-retried.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th consecutive failure,
    /// without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) plus up to a fifth of it in random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let bound = (backoff.as_millis() as u64 / 5).max(1);
        let jitter = rand::rng().random_range(0..=bound);
        backoff.saturating_add(Duration::from_millis(jitter))
    }

    pub fn exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}
