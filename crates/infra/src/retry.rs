//! Redelivery backoff for retryable job failures.

use std::time::Duration;

use rand::Rng;

/// Retry policy configuration.
///
/// Attempts are 1-based and counted by the broker. The policy only decides whether
/// another attempt is allowed and how long the broker should hold the message first.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Relative jitter (0.0-1.0) applied symmetrically around the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays and no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            factor: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Delay after the failure of `attempt` (1-indexed), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = self.factor.powi(attempt.saturating_sub(1).min(64) as i32);

        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Delay after the failure of `attempt`, with ±`jitter` applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_for_attempt(attempt).as_millis() as f64;

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another delivery is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.base_delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.base_delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(policy.base_delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();

        for _ in 0..200 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(3200), "{delay:?}");
            assert!(delay <= Duration::from_millis(4800), "{delay:?}");
        }
    }

    #[test]
    fn fixed_policy_has_no_jitter() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
    }

    #[test]
    fn retries_until_the_budget_is_spent() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }
}
