//! Pure scheduling policy for failed jobs.
//!
//! `new_attempts` is always the post-increment attempt count: the first
//! failure of a fresh job calls these functions with `new_attempts = 1`, so
//! the first retry waits `backoff_base` seconds rather than one.

use chrono::{DateTime, Duration, Utc};

/// Fallback when the `backoff_base` config entry is missing or unparsable.
pub const DEFAULT_BACKOFF_BASE: i64 = 2;

/// Delays are capped so a long-failing job with a large base cannot push its
/// next attempt beyond any useful horizon.
const MAX_DELAY_SECONDS: i64 = 60 * 60 * 24 * 365;

/// A job whose attempt count has passed `max_retries` is retired to the
/// dead-letter queue instead of being rescheduled.
pub fn is_exhausted(new_attempts: i64, max_retries: i64) -> bool {
    new_attempts > max_retries
}

/// Seconds to wait before the next attempt: `backoff_base ^ new_attempts`.
///
/// A base of 1 degenerates to a fixed 1-second delay per retry; bases below
/// 1 are clamped to 1.
pub fn backoff_delay(new_attempts: i64, backoff_base: i64) -> Duration {
    let base = backoff_base.max(1);
    let exponent = new_attempts.clamp(0, 62) as u32;
    let seconds = base.saturating_pow(exponent).min(MAX_DELAY_SECONDS);

    Duration::seconds(seconds)
}

/// The instant at which a failed job becomes eligible again.
pub fn next_attempt_at(
    new_attempts: i64,
    backoff_base: i64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    now + backoff_delay(new_attempts, backoff_base)
}
