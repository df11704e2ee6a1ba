//! Clock abstractions used by the decaying counters and limit-expiry logic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe time source abstraction.
///
/// Implementers must document whether the origin is wall-clock (e.g., UNIX
/// epoch) or an arbitrary test epoch. The return value is milliseconds since
/// that origin. Calls must be safe concurrently (`Send + Sync`). Counter
/// timestamps cross the wire to peer nodes, so production clocks must share
/// the UNIX epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds relative to the implementer's origin.
    fn now_millis(&self) -> u64;
}

/// Wall clock reporting milliseconds since the UNIX epoch.
///
/// Readings from different hosts are directly comparable, which is what lets
/// a replica decay a counter written by another node. A system clock stepped
/// backwards past the epoch reads as 0 rather than panicking.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new wall clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Hand-cranked clock for deterministic tests.
///
/// Starts at an arbitrary origin and only moves when told to. Clones share
/// state, so a clock handed to a limiter and a copy kept by the test advance
/// together.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading `start` milliseconds.
    pub fn new(start: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start)) }
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
