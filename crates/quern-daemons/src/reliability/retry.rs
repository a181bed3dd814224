//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for action retries
///
/// Supports exponential backoff with additive jitter to avoid thundering herd.
/// The delay after the n-th failed attempt is
/// `backoff_seconds * backoff_factor^(n-1) + uniform(0, jitter_seconds)`.
///
/// # Example
///
/// ```
/// use quern_daemons::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_backoff_seconds(1.0)
///     .with_backoff_factor(2.0);
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Base delay in seconds before the first retry
    pub backoff_seconds: f64,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_factor: f64,

    /// Upper bound in seconds of the uniform jitter added to each delay
    pub jitter_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_seconds: 0.0,
            backoff_factor: 1.0,
            jitter_seconds: 0.0,
        }
    }

    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second base delay
    /// - 2x backoff factor
    /// - up to 100ms of jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            backoff_seconds: 1.0,
            backoff_factor: 2.0,
            jitter_seconds: 0.1,
        }
    }

    /// Create a policy with fixed intervals (no backoff growth)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_seconds: interval.as_secs_f64(),
            backoff_factor: 1.0,
            jitter_seconds: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base backoff delay in seconds
    pub fn with_backoff_seconds(mut self, seconds: f64) -> Self {
        self.backoff_seconds = seconds.max(0.0);
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    /// Set the jitter upper bound in seconds
    pub fn with_jitter_seconds(mut self, seconds: f64) -> Self {
        self.jitter_seconds = seconds.max(0.0);
        self
    }

    /// Calculate the delay before re-queueing after the given number of
    /// failed attempts (1-based: pass 1 after the first failure).
    pub fn delay_after_attempt(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let base = self.backoff_seconds * self.backoff_factor.powi(exponent as i32);

        let jittered = if self.jitter_seconds > 0.0 {
            let mut rng = rand::thread_rng();
            base + rng.gen_range(0.0..self.jitter_seconds)
        } else {
            base
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Check whether more attempts remain after `completed_attempts` have run
    pub fn has_attempts_remaining(&self, completed_attempts: u32) -> bool {
        completed_attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_seconds, 1.0);
        assert_eq!(policy.backoff_factor, 2.0);
    }

    #[test]
    fn test_delay_after_attempt() {
        let policy = RetryPolicy::exponential().with_jitter_seconds(0.0);

        // First failure -> base delay
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));

        // Second failure -> base * factor
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));

        // Third failure -> base * factor^2
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::exponential()
            .with_backoff_seconds(0.5)
            .with_jitter_seconds(0.25);

        for _ in 0..32 {
            let delay = policy.delay_after_attempt(1);
            assert!(delay >= Duration::from_secs_f64(0.5));
            assert!(delay < Duration::from_secs_f64(0.75));
        }
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
