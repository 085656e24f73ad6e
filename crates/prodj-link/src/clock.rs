//! Clock capability (spec.md §9): the link core never reads wall-clock time
//! directly, so tests can drive scheduling deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use prodj_protocol::model::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real clock, grounded in the teacher's `input_mux::now_nanos()` pattern:
/// a `OnceLock<Instant>` fixed epoch so elapsed time is representable in a
/// plain integer instead of an opaque `Instant`.
#[derive(Debug, Default)]
pub struct SystemClock;

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(epoch().elapsed().as_micros() as u64)
    }
}

/// Test double: time advances only when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { micros: AtomicU64::new(0) }
    }

    pub fn advance_micros(&self, delta: u64) {
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: u64) {
        self.advance_micros(delta * 1000);
    }

    pub fn set_micros(&self, value: u64) {
        self.micros.store(value, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.micros.load(Ordering::SeqCst))
    }
}
