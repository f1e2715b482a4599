//! Backoff schedule lookup

use std::time::{Duration, SystemTime};

/// Wait required after the `attempts`-th failure before trying again
///
/// # Formula
/// `schedule[attempts - 1]`, clamped to the last entry once `attempts`
/// runs past the end of the schedule. An attempt count of 0 (a message
/// re-queued from the dead-letter table) uses the first entry.
///
/// An empty schedule means "retry on every tick".
#[must_use]
pub fn retry_interval(attempts: u32, schedule: &[Duration]) -> Duration {
    let index = usize::try_from(attempts.saturating_sub(1)).unwrap_or(usize::MAX);
    schedule
        .get(index)
        .or_else(|| schedule.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// `true` once at least `interval` has passed since `last_attempt`
///
/// A `last_attempt` in the future (clock skew) is never due.
#[must_use]
pub fn is_due(last_attempt: SystemTime, interval: Duration, now: SystemTime) -> bool {
    now.duration_since(last_attempt)
        .is_ok_and(|elapsed| elapsed >= interval)
}
