//! Exponential backoff between step retries.

use std::time::Duration;

/// Backoff policy: `delay = base * 2^attempt`, capped at `cap`.
///
/// # Default Values
///
/// - `base`: 100ms
/// - `cap`: 30 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit multiplied by the doubling factor.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Calculates the delay before re-dispatching a step whose retry count is
    /// now `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base, Duration::from_millis(100));
        assert_eq!(policy.cap, Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(31), Duration::from_secs(1));
        assert_eq!(policy.backoff(64), Duration::from_secs(1));
    }
}
