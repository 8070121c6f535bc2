//! Retry schedule for failed deliveries.

use std::time::Duration;

/// Delay before the next attempt, indexed by the attempt count *before* the
/// failure is recorded. Attempts past the end reuse the last entry.
///
/// Hand-tuned and irregular on purpose; it is a lookup table, not a formula.
pub const BACKOFF_SCHEDULE_SECS: [u64; 6] = [60, 300, 900, 3_600, 21_600, 86_400];

/// Attempts after which an event is terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Retry delay for an event that has failed `attempt_count` times so far,
/// or `None` once `attempt_count` has reached `max_attempts`.
pub fn retry_delay(attempt_count: u32, max_attempts: u32) -> Option<Duration> {
    if attempt_count >= max_attempts {
        return None;
    }
    let index = (attempt_count as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Some(Duration::from_secs(BACKOFF_SCHEDULE_SECS[index]))
}
