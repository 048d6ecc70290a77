//! Monotonic time for the protocol timers
//!
//! Every timer in the stack (contention windows, T1..T4, Tr, Th, broadcast pacing) is measured
//! against a [Clock] owned by the network. Production code uses [MonotonicClock]; tests drive a
//! [ManualClock] forward explicitly instead of sleeping.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of monotonic instants
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// The real, monotonic system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same offset, so a test can hand one clone to the network and keep another to
/// [advance](ManualClock::advance) time between `update()` calls.
#[derive(Clone, Debug)]
pub struct ManualClock {
    epoch: Instant,
    offset_us: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.offset_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_micros(self.offset_us.load(Ordering::Relaxed))
    }
}
