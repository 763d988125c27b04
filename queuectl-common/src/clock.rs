//! Clock abstraction so eligibility and backoff are testable without sleeping.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::timestamp::truncate_to_seconds;

/// Source of the current time, truncated to whole seconds to match the
/// persisted timestamp precision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_seconds(Utc::now())
    }
}

/// A clock pinned to a fixed instant, advanced manually. For tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(truncate_to_seconds(now)),
        }
    }

    /// Move the clock forward by the given number of seconds.
    pub fn advance(&self, seconds: i64) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += Duration::seconds(seconds);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}
