//! Retry policy for batch commits

use std::time::Duration;

/// Bounded attempts with exponential backoff
///
/// The wait before retry `i` (zero based) is `base_delay * 2^i`. The policy is
/// pure; the sink does the sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after the failed attempt with index `attempt_index`
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another attempt may follow `attempts_made`
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Total wait across `failures` consecutive failed attempts that are retried
    pub fn total_delay(&self, failures: u32) -> Duration {
        (0..failures).map(|i| self.delay_for(i)).sum()
    }
}
