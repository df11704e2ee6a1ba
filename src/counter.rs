//! Decaying counter storage.
//!
//! Each stored value is a non-negative count that halves every `half_life`
//! milliseconds. The physical representation is one float plus one
//! timestamp, which keeps counters additively mergeable across replicas: any
//! two replica states can be reconciled by decaying both to the same instant
//! and taking the maximum. A moving window would need per-event timestamps
//! and has no such merge.
//!
//! This is the storage adapter a DHT node plugs its store/lookup RPCs into:
//! [`CounterStore::add`] backs `PUT`, [`CounterStore::peek`] serves replica
//! reads, and [`CounterStore::absorb`] ingests replicated pairs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A non-negative count that halves every `half_life` milliseconds.
///
/// The stored `value` is only meaningful together with `last_touched`; all
/// reads decay to the caller's `now` first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayingCounter {
    value: f64,
    last_touched: u64,
}

impl DecayingCounter {
    /// Create a counter holding `value` as of `now`.
    pub fn new(value: f64, now: u64) -> Self {
        Self { value: value.max(0.0), last_touched: now }
    }

    /// The counter's value decayed to `now`.
    ///
    /// A `now` earlier than the last touch reads the value undecayed; clocks
    /// that step backwards must not inflate counters.
    pub fn value_at(&self, now: u64, half_life: Duration) -> f64 {
        decay(self.value, self.last_touched, now, half_life)
    }

    /// The raw `(value, last_touched)` pair, as replicated on the wire.
    pub fn raw(&self) -> (f64, u64) {
        (self.value, self.last_touched)
    }
}

fn decay(value: f64, from: u64, to: u64, half_life: Duration) -> f64 {
    if to <= from || value == 0.0 {
        return value;
    }
    let half_life_ms = half_life.as_millis().max(1) as f64;
    value * 2f64.powf(-((to - from) as f64) / half_life_ms)
}

/// Per-node key→counter map with half-life decay and `min_value` eviction.
///
/// All operations take `now` explicitly; the store holds no clock of its own
/// so tests and replicas stay deterministic.
#[derive(Debug)]
pub struct CounterStore {
    counters: Mutex<HashMap<Vec<u8>, DecayingCounter>>,
    half_life: Duration,
    min_value: f64,
}

impl CounterStore {
    pub fn new(half_life: Duration, min_value: f64) -> Self {
        Self { counters: Mutex::new(HashMap::new()), half_life, min_value }
    }

    /// Decay the stored value to `now`, add `delta`, and return the
    /// post-write value. Absent keys start at zero.
    pub fn add(&self, key: &[u8], delta: f64, now: u64) -> f64 {
        let mut counters = self.counters.lock().unwrap();
        let current = counters
            .get(key)
            .map(|c| c.value_at(now, self.half_life))
            .unwrap_or(0.0);
        let updated = current + delta.max(0.0);
        counters.insert(key.to_vec(), DecayingCounter::new(updated, now));
        updated
    }

    /// The stored raw pair for `key`, if any. Serves replica-read replies;
    /// the reader decays, so the pair travels undecayed.
    pub fn peek(&self, key: &[u8]) -> Option<(f64, u64)> {
        self.counters.lock().unwrap().get(key).map(DecayingCounter::raw)
    }

    /// The decayed value for `key` at `now`, or 0 when absent.
    pub fn value(&self, key: &[u8], now: u64) -> f64 {
        self.counters
            .lock()
            .unwrap()
            .get(key)
            .map(|c| c.value_at(now, self.half_life))
            .unwrap_or(0.0)
    }

    /// Merge a replicated `(value, last_touched)` pair into the local state
    /// by decayed maximum, and return the merged value.
    pub fn absorb(&self, key: &[u8], value: f64, last_touched: u64, now: u64) -> f64 {
        let incoming = decay(value.max(0.0), last_touched, now, self.half_life);
        let mut counters = self.counters.lock().unwrap();
        let local = counters
            .get(key)
            .map(|c| c.value_at(now, self.half_life))
            .unwrap_or(0.0);
        let merged = incoming.max(local);
        counters.insert(key.to_vec(), DecayingCounter::new(merged, now));
        merged
    }

    /// Drop every counter whose decayed value has fallen below `min_value`.
    /// Returns the number of evicted keys. Cadence is the owner's choice;
    /// correctness only needs this to run eventually.
    pub fn sweep(&self, now: u64) -> usize {
        let mut counters = self.counters.lock().unwrap();
        let before = counters.len();
        let half_life = self.half_life;
        let min_value = self.min_value;
        counters.retain(|_, c| c.value_at(now, half_life) >= min_value);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().unwrap().is_empty()
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn min_value(&self) -> f64 {
        self.min_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_LIFE: Duration = Duration::from_millis(1_000);

    fn store() -> CounterStore {
        CounterStore::new(HALF_LIFE, 0.1)
    }

    #[test]
    fn decay_law_halves_per_half_life() {
        let counter = DecayingCounter::new(8.0, 0);
        assert!((counter.value_at(1_000, HALF_LIFE) - 4.0).abs() < 1e-9);
        assert!((counter.value_at(2_000, HALF_LIFE) - 2.0).abs() < 1e-9);
        assert!((counter.value_at(3_000, HALF_LIFE) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn decay_is_continuous_between_half_lives() {
        let counter = DecayingCounter::new(8.0, 0);
        let read = counter.value_at(500, HALF_LIFE);
        let expected = 8.0 * 2f64.powf(-0.5);
        assert!((read - expected).abs() < 1e-9);
    }

    #[test]
    fn backwards_clock_does_not_inflate() {
        let counter = DecayingCounter::new(8.0, 5_000);
        assert_eq!(counter.value_at(4_000, HALF_LIFE), 8.0);
    }

    #[test]
    fn add_decays_then_accumulates() {
        let s = store();
        assert_eq!(s.add(b"k", 10.0, 0), 10.0);
        // One half-life later: 10 → 5, plus 3.
        let v = s.add(b"k", 3.0, 1_000);
        assert!((v - 8.0).abs() < 1e-9);
    }

    #[test]
    fn same_instant_adds_are_associative() {
        let split = store();
        split.add(b"k", 2.5, 500);
        split.add(b"k", 4.5, 500);

        let single = store();
        single.add(b"k", 7.0, 500);

        assert!((split.value(b"k", 500) - single.value(b"k", 500)).abs() < 1e-9);
    }

    #[test]
    fn zero_delta_is_an_idempotent_read() {
        let s = store();
        s.add(b"k", 6.0, 0);
        let read = s.add(b"k", 0.0, 1_000);
        assert!((read - 3.0).abs() < 1e-9);
        assert!((s.value(b"k", 1_000) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn negative_delta_is_clamped() {
        let s = store();
        assert_eq!(s.add(b"k", -5.0, 0), 0.0);
    }

    #[test]
    fn absent_key_reads_zero() {
        let s = store();
        assert_eq!(s.value(b"missing", 123), 0.0);
        assert!(s.peek(b"missing").is_none());
    }

    #[test]
    fn absorb_takes_decayed_maximum() {
        let s = store();
        s.add(b"k", 4.0, 0);
        // Incoming replica wrote 16 one half-life ago: decays to 8, beats
        // the local 4 (decayed: 4 at now=0 → 4·2^-1=2 at 1000).
        let merged = s.absorb(b"k", 16.0, 0, 1_000);
        assert!((merged - 8.0).abs() < 1e-9);
        assert!((s.value(b"k", 1_000) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn absorb_keeps_larger_local_value() {
        let s = store();
        s.add(b"k", 40.0, 1_000);
        let merged = s.absorb(b"k", 1.0, 1_000, 1_000);
        assert!((merged - 40.0).abs() < 1e-9);
    }

    #[test]
    fn absorb_into_empty_store_installs_incoming() {
        let s = store();
        let merged = s.absorb(b"k", 6.0, 0, 1_000);
        assert!((merged - 3.0).abs() < 1e-9);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn sweep_evicts_below_min_value() {
        let s = store();
        s.add(b"hot", 100.0, 0);
        s.add(b"cold", 0.2, 0);
        // After two half-lives: hot=25, cold=0.05 < 0.1.
        let evicted = s.sweep(2_000);
        assert_eq!(evicted, 1);
        assert_eq!(s.len(), 1);
        assert!(s.peek(b"hot").is_some());
        assert!(s.peek(b"cold").is_none());
    }

    #[test]
    fn sweep_keeps_values_at_threshold() {
        let s = store();
        s.add(b"edge", 0.1, 0);
        assert_eq!(s.sweep(0), 0);
        assert_eq!(s.len(), 1);
    }
}
