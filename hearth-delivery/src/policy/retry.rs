//! Retry policy for delivery recovery.
//!
//! Encapsulates the retry budget, the backoff schedule, the key-transition
//! window and the lock lifetimes, so the recovery processor can be reasoned
//! about and tested independently of its collaborators.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    error::SystemError,
    queue::retry::{is_due, retry_interval},
};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of failed attempts after which a message is dead-lettered.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Wait before the next attempt, indexed by `attempts - 1` and clamped
    /// to the last entry (in milliseconds).
    ///
    /// Default: `[1000, 5000, 15000]`
    #[serde(default = "defaults::retry_intervals_ms")]
    pub retry_intervals_ms: Vec<u64>,

    /// How long a key transition may stay open before the message is
    /// dead-lettered regardless of its remaining attempts (in milliseconds).
    /// Also the TTL of the transition lock.
    ///
    /// Default: 30000
    #[serde(default = "defaults::transition_timeout_ms")]
    pub transition_timeout_ms: u64,

    /// Tick interval of the background processor (in milliseconds).
    ///
    /// Default: 1000
    #[serde(default = "defaults::process_interval_ms")]
    pub process_interval_ms: u64,

    /// TTL of message and thread locks (in milliseconds). A crashed holder's
    /// lock expires after this long.
    ///
    /// Default: 10000
    #[serde(default = "defaults::lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Upper bound on retries running at once within one tick.
    ///
    /// Default: 8
    #[serde(default = "defaults::max_concurrent_retries")]
    pub max_concurrent_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            retry_intervals_ms: defaults::retry_intervals_ms(),
            transition_timeout_ms: defaults::transition_timeout_ms(),
            process_interval_ms: defaults::process_interval_ms(),
            lock_ttl_ms: defaults::lock_ttl_ms(),
            max_concurrent_retries: defaults::max_concurrent_retries(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject configurations the processor cannot run with.
    ///
    /// # Errors
    /// If the retry budget, schedule, or concurrency limit is zero/empty
    pub fn validate(&self) -> Result<(), SystemError> {
        if self.max_retries == 0 {
            return Err(SystemError::Configuration(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_intervals_ms.is_empty() {
            return Err(SystemError::Configuration(
                "retry_intervals_ms must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_retries == 0 {
            return Err(SystemError::Configuration(
                "max_concurrent_retries must be at least 1".to_string(),
            ));
        }
        if self.process_interval_ms == 0 {
            return Err(SystemError::Configuration(
                "process_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff required after `attempts` failures.
    #[must_use]
    pub fn retry_interval(&self, attempts: u32) -> Duration {
        let schedule: Vec<Duration> = self
            .retry_intervals_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect();
        retry_interval(attempts, &schedule)
    }

    /// `true` if a message with `attempts` failures, last tried at
    /// `last_attempt`, may be retried at `now`.
    #[must_use]
    pub fn is_due(&self, attempts: u32, last_attempt: SystemTime, now: SystemTime) -> bool {
        is_due(last_attempt, self.retry_interval(attempts), now)
    }

    /// `true` once the retry budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }

    /// `true` if a transition opened at `started` has outlived its window.
    #[must_use]
    pub fn transition_expired(&self, started: SystemTime, now: SystemTime) -> bool {
        now.duration_since(started)
            .is_ok_and(|elapsed| elapsed > self.transition_timeout())
    }

    #[must_use]
    pub const fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    #[must_use]
    pub const fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub fn retry_intervals_ms() -> Vec<u64> {
        vec![1000, 5000, 15000]
    }

    pub const fn transition_timeout_ms() -> u64 {
        30_000
    }

    pub const fn process_interval_ms() -> u64 {
        1000
    }

    pub const fn lock_ttl_ms() -> u64 {
        10_000
    }

    pub const fn max_concurrent_retries() -> usize {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_intervals_ms, vec![1000, 5000, 15000]);
        assert_eq!(policy.transition_timeout(), Duration::from_secs(30));
        assert_eq!(policy.process_interval(), Duration::from_secs(1));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_monotonic_and_clamped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.retry_interval(1), Duration::from_millis(1000));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(5000));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(15000));
        for attempts in 4..10 {
            assert_eq!(policy.retry_interval(attempts), Duration::from_millis(15000));
        }
    }

    #[test]
    fn test_is_due_follows_schedule() {
        let policy = RetryPolicy::default();
        let last = SystemTime::now();

        assert!(!policy.is_due(1, last, last + Duration::from_millis(999)));
        assert!(policy.is_due(1, last, last + Duration::from_millis(1000)));
        assert!(!policy.is_due(2, last, last + Duration::from_millis(4999)));
        assert!(policy.is_due(3, last, last + Duration::from_millis(15000)));

        // Re-queued dead letters are immediately eligible
        assert!(policy.is_due(0, SystemTime::UNIX_EPOCH, last));
    }

    #[test]
    fn test_is_exhausted() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_transition_window() {
        let policy = RetryPolicy::default();
        let started = SystemTime::now();

        assert!(!policy.transition_expired(started, started + Duration::from_secs(30)));
        assert!(policy.transition_expired(started, started + Duration::from_secs(31)));
        assert!(!policy.transition_expired(started + Duration::from_secs(5), started));
    }

    #[test]
    fn test_policy_from_ron() {
        let policy: RetryPolicy =
            ron::from_str("(max_retries: 5, retry_intervals_ms: [10, 20])").expect("valid policy");
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.retry_interval(7), Duration::from_millis(20));
        assert_eq!(policy.transition_timeout_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_unusable_policies() {
        let policy = RetryPolicy {
            retry_intervals_ms: Vec::new(),
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
