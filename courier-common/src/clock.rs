//! Pluggable wall-clock source.
//!
//! Backoff and expiry decisions depend on "now"; injecting the clock
//! lets tests advance time without real sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: u64 = 1_000_000_000;

pub trait Clock: Send + Sync {
    /// Nanoseconds since the unix epoch.
    fn now_ns(&self) -> u64;

    /// Whole seconds since the unix epoch, for the expiry field.
    fn now_s(&self) -> i64 {
        (self.now_ns() / NANOS_PER_SEC) as i64
    }
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is set before the unix epoch")
            .as_nanos() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}
