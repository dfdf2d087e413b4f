//! Time sources.
//!
//! The library never reads the system clock directly. Hosts supply a [`Clock`]
//! yielding monotonic milliseconds (timers, debouncing, retry schedules) and a
//! wall-clock timestamp (OCPP message payloads).

use std::cell::Cell;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Host-supplied time source.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary epoch. Never decreases.
    fn millis(&self) -> u64;

    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Default clock backed by [`Instant`] and [`Utc::now`].
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for development and testing.
///
/// Wall-clock time advances in lockstep with the monotonic counter, starting
/// from `base`.
pub struct SimClock {
    millis: Cell<u64>,
    base: DateTime<Utc>,
}

impl SimClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            millis: Cell::new(0),
            base,
        }
    }

    /// Move time forward by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.millis.set(self.millis.get() + ms);
    }
}

impl Clock for SimClock {
    fn millis(&self) -> u64 {
        self.millis.get()
    }

    fn now(&self) -> DateTime<Utc> {
        self.base + Duration::milliseconds(self.millis.get() as i64)
    }
}
