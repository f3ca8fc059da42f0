//! Latest RSSI pushed by a background watcher, with an age limit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::LinkError;

/// Shared slot holding the most recent RSSI and when it arrived.
///
/// Clones share the slot, so a watcher task can write while the driver reads.
#[derive(Debug, Clone, Default)]
pub struct LatestSample {
    slot: Arc<Mutex<Option<(i8, Instant)>>>,
}

impl LatestSample {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<(i8, Instant)>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a reading taken now.
    pub fn record(&self, rssi: i16) {
        self.record_at(rssi, Instant::now());
    }

    /// Store a reading taken at `at`, saturating to the `i8` range.
    pub fn record_at(&self, rssi: i16, at: Instant) {
        let rssi = i8::try_from(rssi).unwrap_or(if rssi < 0 { i8::MIN } else { i8::MAX });
        *self.slot() = Some((rssi, at));
    }

    /// Forget the stored reading.
    pub fn clear(&self) {
        *self.slot() = None;
    }

    /// The stored reading if it is younger than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NoReading`] if nothing was stored or the reading
    /// is too old.
    pub fn fresh(&self, max_age: Duration) -> Result<i8, LinkError> {
        self.fresh_at(Instant::now(), max_age)
    }

    /// [`Self::fresh`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NoReading`] if nothing was stored or the reading
    /// is too old.
    pub fn fresh_at(&self, now: Instant, max_age: Duration) -> Result<i8, LinkError> {
        match *self.slot() {
            Some((rssi, at)) if now.saturating_duration_since(at) <= max_age => Ok(rssi),
            _ => Err(LinkError::NoReading),
        }
    }
}
