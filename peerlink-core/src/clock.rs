//! Time source for last-seen stamps and liveness sweeps.
//!
//! Timestamps are seconds since the Unix epoch as `f64`, the same unit peers use
//! for message `ts` fields and log positions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock that only moves when told to. Used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.now.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + secs).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.now.load(Ordering::SeqCst))
    }
}

/// Monotonic non-decreasing timestamp readable from any thread without tearing.
///
/// Stored as `f64` bits; for non-negative floats the bit patterns order the same way
/// as the values, so `fetch_max` on the bits is `max` on the timestamps.
#[derive(Debug)]
pub struct AtomicTimestamp(AtomicU64);

impl AtomicTimestamp {
    pub fn new(ts: f64) -> Self {
        Self(AtomicU64::new(sanitize(ts).to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `ts`; earlier values are ignored.
    pub fn advance(&self, ts: f64) {
        self.0.fetch_max(sanitize(ts).to_bits(), Ordering::AcqRel);
    }
}

fn sanitize(ts: f64) -> f64 {
    if ts.is_finite() && ts > 0.0 {
        ts
    } else {
        0.0
    }
}
