//! Per-node tables: pending local counts (drained every interval) and the
//! block table the synchronous check path reads.
//!
//! The block table is a whole-map snapshot behind `ArcSwap`: the update loop
//! builds a fresh map and installs it with one pointer swap, so a check sees
//! either the old table or the new one, never a partial view.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};

/// Limit → last-activation-time map for one key.
///
/// A key rarely sees more than a handful of distinct limits, so this is a
/// small vector rather than a map. Limits compare by exact value; callers
/// pass the same constants on every check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Limits(Vec<(f64, u64)>);

impl Limits {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Record that `limit` was asked about at `now`. A limit already present
    /// keeps its original activation time.
    pub fn touch(&mut self, limit: f64, now: u64) {
        if !self.0.iter().any(|(l, _)| *l == limit) {
            self.0.push((limit, now));
        }
    }

    /// The smallest limit present. Empty limits never block anything.
    pub fn min_limit(&self) -> f64 {
        self.0.iter().map(|(l, _)| *l).fold(f64::INFINITY, f64::min)
    }

    /// Copy entries from `older` whose activation is at or after `cutoff`
    /// and whose limit this set does not already carry. Keeps long-lived
    /// limits active even when only some were exercised this interval.
    pub fn carry_forward(&mut self, older: &Limits, cutoff: u64) {
        for &(limit, seen) in &older.0 {
            if seen >= cutoff && !self.0.iter().any(|(l, _)| *l == limit) {
                self.0.push((limit, seen));
            }
        }
    }

    /// Drop entries activated before `cutoff`.
    pub fn retain_recent(&mut self, cutoff: u64) {
        self.0.retain(|(_, seen)| *seen >= cutoff);
    }

    /// Re-evaluate against a fresh global rate: limits still being exceeded
    /// (at or under the rate) refresh to `now`; limits above it keep their
    /// old activation time and age toward expiry.
    pub fn refresh_exceeded(&mut self, rate: f64, now: u64) {
        for (limit, seen) in &mut self.0 {
            if *limit <= rate {
                *seen = now;
            }
        }
    }

    /// Refresh every activation to `now`. The conservative move when the
    /// global counter is unreadable: the key stays blocked a full window.
    pub fn refresh_all(&mut self, now: u64) {
        for (_, seen) in &mut self.0 {
            *seen = now;
        }
    }

    pub fn activation(&self, limit: f64) -> Option<u64> {
        self.0.iter().find(|(l, _)| *l == limit).map(|(_, seen)| *seen)
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pending increments and active limits for one key in the current interval.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalCounter {
    pub pending: f64,
    pub limits: Limits,
}

/// Per-key pending increments, accumulated between interval ticks.
///
/// `bump` is the hot path's only write: a map lookup plus an add, no I/O,
/// allocation only on first sight of a key.
#[derive(Debug, Default)]
pub(crate) struct LocalTable {
    inner: Mutex<HashMap<Vec<u8>, LocalCounter>>,
}

impl LocalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, key: &[u8], limit: f64, delta: f64, now: u64) {
        let mut table = self.inner.lock().unwrap();
        match table.get_mut(key) {
            Some(counter) => {
                counter.pending += delta;
                counter.limits.touch(limit, now);
            }
            None => {
                let mut counter = LocalCounter { pending: delta, limits: Limits::new() };
                counter.limits.touch(limit, now);
                table.insert(key.to_vec(), counter);
            }
        }
    }

    /// Swap in a fresh empty table and return the old contents. The swap is
    /// atomic with respect to `bump`: every bump lands wholly in one
    /// interval or the next.
    pub fn drain(&self) -> HashMap<Vec<u8>, LocalCounter> {
        mem::take(&mut *self.inner.lock().unwrap())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// One currently-blocked key: the cluster-wide rate seen at the last
/// aggregation and the limits recently asked about for the key.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    /// Normalized global rate in requests per second.
    pub global_rate: f64,
    /// Active limits and their last activation times.
    pub limits: Limits,
}

/// The full set of currently-blocked keys.
pub type BlockMap = HashMap<Vec<u8>, BlockEntry>;

/// Read-mostly holder for the current [`BlockMap`] snapshot.
#[derive(Debug)]
pub(crate) struct BlockTable {
    inner: ArcSwap<BlockMap>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self { inner: ArcSwap::from_pointee(BlockMap::new()) }
    }

    /// Hot-path read: absent key → allow; present → compare rates.
    pub fn is_allowed(&self, key: &[u8], limit: f64) -> bool {
        self.inner.load().get(key).is_none_or(|entry| entry.global_rate < limit)
    }

    /// Replace the whole table with one snapshot swap.
    pub fn install(&self, blocks: BlockMap) -> Arc<BlockMap> {
        let snapshot = Arc::new(blocks);
        self.inner.store(snapshot.clone());
        snapshot
    }

    /// Fold re-check survivors into the live table. One clone-and-swap for
    /// the whole batch; readers see the entries appear together.
    pub fn merge(&self, entries: Vec<(Vec<u8>, BlockEntry)>) {
        if entries.is_empty() {
            return;
        }
        self.inner.rcu(|current| {
            let mut next: BlockMap = (**current).clone();
            for (key, entry) in &entries {
                next.insert(key.clone(), entry.clone());
            }
            next
        });
    }

    pub fn snapshot(&self) -> Arc<BlockMap> {
        self.inner.load_full()
    }
}
