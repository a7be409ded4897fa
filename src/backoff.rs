use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with a retry budget.
///
/// The budget does not stop retries; it marks the point where a caller should
/// report the failure as persistent. Storage writes are never abandoned just
/// because the budget ran out.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    initial: Duration,
    max: Duration,
    budget: u32,
    attempt: u32,
}

impl RetryBackoff {
    pub fn new(cfg: &RetryConfig) -> Self {
        Self {
            initial: cfg.initial_backoff,
            max: cfg.max_backoff.max(cfg.initial_backoff),
            budget: cfg.max_attempts,
            attempt: 0,
        }
    }

    /// Returns the delay before the next attempt and records the attempt.
    pub fn next_backoff(&mut self) -> Duration {
        let shift = self.attempt.min(31);
        let delay = self
            .initial
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn started(&self) -> bool {
        self.attempt > 0
    }

    /// Whether the failure count reached the configured budget.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.budget
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut b = RetryBackoff::new(&policy());
        assert!(!b.started());
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
        assert_eq!(b.next_backoff(), Duration::from_millis(200));
        assert_eq!(b.next_backoff(), Duration::from_millis(400));
        assert_eq!(b.next_backoff(), Duration::from_millis(800));
        assert_eq!(b.next_backoff(), Duration::from_secs(1));
        assert_eq!(b.next_backoff(), Duration::from_secs(1));
        assert_eq!(b.attempt(), 6);
    }

    #[test]
    fn test_backoff_budget_and_reset() {
        let mut b = RetryBackoff::new(&policy());
        b.next_backoff();
        b.next_backoff();
        assert!(!b.exhausted());
        b.next_backoff();
        assert!(b.exhausted());

        b.reset();
        assert!(!b.started());
        assert!(!b.exhausted());
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_large_attempt_count_saturates() {
        let mut b = RetryBackoff::new(&policy());
        for _ in 0..100 {
            assert!(b.next_backoff() <= Duration::from_secs(1));
        }
    }
}
