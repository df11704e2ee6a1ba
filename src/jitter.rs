//! Jitter for interval scheduling, to keep a fleet of nodes from hitting the
//! DHT in lockstep
//!
//! When to use which strategy:
//! - `None`: deterministic ticks for tests or tightly controlled runs.
//! - `Spread(s)`: multiplies each delay by `1 + s·(rand − 0.5)`; the default
//!   spread of 0.1 gives the ±5% used by the global update loop.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via `apply_with_rng`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics on very large durations.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing scheduling delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact delay
    None,
    /// Multiplicative noise: `delay · (1 + spread·(rand − 0.5))`
    Spread(f64),
}

impl Jitter {
    /// The loop's standard ±5% spread.
    pub fn interval() -> Self {
        Jitter::Spread(0.1)
    }

    /// Create a spread jitter. `spread` must be in `[0, 2]` so the factor
    /// stays non-negative.
    pub fn spread(spread: f64) -> Result<Self, &'static str> {
        if !(0.0..=2.0).contains(&spread) {
            return Err("spread jitter: spread must be within [0, 2]");
        }
        Ok(Jitter::Spread(spread))
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_internal(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        self.apply_internal(delay, rng)
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX) // Saturate extremely large durations
    }

    fn apply_internal<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Spread(spread) => {
                let millis = Self::as_millis_saturated(delay) as f64;
                let factor = 1.0 + spread * (rng.random::<f64>() - 0.5);
                Duration::from_millis((millis * factor).max(0.0) as u64)
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::interval()
    }
}
