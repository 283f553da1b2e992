use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for query behavior.
///
/// This controls how long cached data stays fresh, how long unobserved entries
/// are retained, and how failed fetches are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long data is considered fresh after a successful fetch.
    ///
    /// `None` means data only becomes stale when it is invalidated.
    pub stale_time: Option<Duration>,

    /// How long an entry without subscribers is retained before being garbage collected.
    pub gc_time: Duration,

    /// Retry behavior for query fetches.
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: None,
            gc_time: Duration::from_secs(5 * 60), // 5 minutes
            retry: RetryPolicy::default(),
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and garbage collection times.
    #[must_use]
    pub const fn new(stale_time: Option<Duration>, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time,
            retry: RetryPolicy::DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff between failed attempts.
///
/// `max_attempts` counts the first attempt, so the default of 3 calls the fetch
/// function at most three times. The delay after failed attempt `n` is
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
    };

    /// A single attempt, never retried. This is the default for mutations.
    pub const NONE: Self = Self {
        max_attempts: 1,
        ..Self::DEFAULT
    };

    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Returns `true` if another attempt may follow failed attempt number `attempt` (1-based).
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_time, None);
        assert_eq!(config.gc_time, Duration::from_secs(5 * 60));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_new_config() {
        let config = QueryConfig::new(Some(Duration::from_secs(30)), Duration::from_secs(300));
        assert_eq!(config.stale_time, Some(Duration::from_secs(30)));
        assert_eq!(config.gc_time, Duration::from_secs(300));
        assert_eq!(config.retry, RetryPolicy::DEFAULT);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::NONE.should_retry(1));
    }

    #[test]
    fn test_config_from_json() {
        let config: QueryConfig =
            serde_json::from_str(r#"{"retry": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.gc_time, Duration::from_secs(300));
    }
}
