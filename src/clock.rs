//! Clock abstraction for testable time handling
//!
//! Watch status and buffer expiry are stamped into message bodies as epoch
//! seconds, so every worker has to agree on wall-clock time. Tests drive the
//! same code paths with a [`FakeClock`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A clock that provides the current wall-clock time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds since the Unix epoch
    fn epoch_secs(&self) -> f64;

    fn now_utc(&self) -> DateTime<Utc> {
        epoch_to_utc(self.epoch_secs())
    }
}

/// Convert epoch seconds to a UTC timestamp
pub fn epoch_to_utc(epoch_secs: f64) -> DateTime<Utc> {
    let secs = epoch_secs.floor();
    let nanos = ((epoch_secs - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999)).unwrap_or_default()
}

/// Real system clock
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Fake clock for testing with controllable time
#[derive(Debug, Clone)]
pub struct FakeClock {
    epoch_secs: Arc<Mutex<f64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::at(1_000_000.0)
    }

    pub fn at(epoch_secs: f64) -> Self {
        Self {
            epoch_secs: Arc::new(Mutex::new(epoch_secs)),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        *self.epoch_secs.lock() += duration.as_secs_f64();
    }

    /// Advance the clock by a number of seconds
    pub fn advance_secs(&self, secs: f64) {
        *self.epoch_secs.lock() += secs;
    }

    pub fn set_epoch_secs(&self, secs: f64) {
        *self.epoch_secs.lock() = secs;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn epoch_secs(&self) -> f64 {
        *self.epoch_secs.lock()
    }
}
