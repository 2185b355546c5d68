//! Tick sources used to timestamp when a slot last became idle.

use parking_lot::Mutex;
use std::time::Instant;

/// Monotonic, non-decreasing tick counter.
pub trait TickSource: Send + Sync {
    fn now(&self) -> u64;
}

/// Lock-protected counter advanced explicitly by its owner.
///
/// Mirrors a timer-interrupt tick count: something else drives it forward
/// and readers only ever observe it.
#[derive(Debug, Default)]
pub struct ManualTicks {
    ticks: Mutex<u64>,
}

impl ManualTicks {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            ticks: Mutex::new(start),
        }
    }

    /// Advance by `delta` and return the new value.
    pub fn advance(&self, delta: u64) -> u64 {
        let mut ticks = self.ticks.lock();
        *ticks = ticks.saturating_add(delta);
        *ticks
    }

    /// Move the counter to `value`. Values below the current count are
    /// ignored so the counter never runs backwards.
    pub fn set(&self, value: u64) {
        let mut ticks = self.ticks.lock();
        *ticks = (*ticks).max(value);
    }
}

impl TickSource for ManualTicks {
    fn now(&self) -> u64 {
        *self.ticks.lock()
    }
}

/// Microseconds elapsed since construction.
#[derive(Debug)]
pub struct MonotonicTicks {
    origin: Instant,
}

impl MonotonicTicks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}
