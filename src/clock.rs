//! Time source for the admission controller.
//!
//! All timestamps in this crate are **microseconds** on a monotonic axis;
//! the origin is arbitrary but fixed per clock instance.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Instant;

/// Monotonic time source measured in microseconds
pub trait Clock: Send + Sync {
    /// Microseconds since this clock's origin; never decreases
    fn now_micros(&self) -> u64;
}

/// Wall clock backed by [`Instant`]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Hand-stepped clock for deterministic tests
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Advances the clock by `micros`
    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Relaxed)
    }
}
