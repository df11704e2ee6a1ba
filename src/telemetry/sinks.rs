use super::events::BlocksUpdate;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes block-table updates.
///
/// Sinks are `tower::Service`s so they compose with the rest of the tower
/// ecosystem. The limiter forwards updates to attached sinks from a
/// background task; a sink that errors loses only its own update.
pub trait BlocksSink:
    tower::Service<BlocksUpdate, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// A sink that logs one structured line per interval via `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<BlocksUpdate> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, update: BlocksUpdate) -> Self::Future {
        tracing::info!(
            tick = update.tick,
            blocked = update.blocks.len(),
            errors = update.err_count,
            "blocks_update"
        );
        Box::pin(async { Ok(()) })
    }
}

impl BlocksSink for LogSink {
    type SinkError = Infallible;
}

/// In-memory history of block tables, one record per interval.
///
/// Records are kept in tick order and delivery is idempotent: a re-delivered
/// tick replaces its earlier snapshot instead of appending a duplicate, so a
/// sink re-attached after a broadcast lag never double-counts an interval.
/// When the history outgrows its capacity the oldest ticks fall off, but the
/// peak blocked-key count survives eviction so a short burst is still
/// visible after its snapshots are gone.
#[derive(Clone, Debug)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    // Sorted by tick.
    history: Vec<BlocksUpdate>,
    peak_blocked: usize,
    evicted_ticks: u64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(1_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            capacity: capacity.max(1),
        }
    }

    /// The retained history, oldest tick first.
    pub fn updates(&self) -> Vec<BlocksUpdate> {
        self.state.lock().unwrap().history.clone()
    }

    /// The newest retained snapshot.
    pub fn latest(&self) -> Option<BlocksUpdate> {
        self.state.lock().unwrap().history.last().cloned()
    }

    /// The global rate recorded for `key` in the newest snapshot, if the key
    /// is currently blocked.
    pub fn latest_rate(&self, key: &[u8]) -> Option<f64> {
        let state = self.state.lock().unwrap();
        state.history.last().and_then(|u| u.blocks.get(key)).map(|entry| entry.global_rate)
    }

    /// The most keys ever blocked at once, including evicted intervals.
    pub fn peak_blocked(&self) -> usize {
        self.state.lock().unwrap().peak_blocked
    }

    /// Intervals dropped from the front of the history.
    pub fn evicted_ticks(&self) -> u64 {
        self.state.lock().unwrap().evicted_ticks
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().history.is_empty()
    }

    /// Forget everything, peak and eviction counts included.
    pub fn clear(&self) {
        *self.state.lock().unwrap() = MemoryState::default();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<BlocksUpdate> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, update: BlocksUpdate) -> Self::Future {
        let mut state = self.state.lock().unwrap();
        state.peak_blocked = state.peak_blocked.max(update.blocks.len());
        match state.history.binary_search_by_key(&update.tick, |u| u.tick) {
            Ok(found) => state.history[found] = update,
            Err(slot) => state.history.insert(slot, update),
        }
        while state.history.len() > self.capacity {
            state.history.remove(0);
            state.evicted_ticks += 1;
        }
        Box::pin(async { Ok(()) })
    }
}

impl BlocksSink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{BlockEntry, BlockMap, Limits};

    fn update(tick: u64, keys: &[(&[u8], f64)]) -> BlocksUpdate {
        let mut blocks = BlockMap::new();
        for (key, rate) in keys {
            let mut limits = Limits::new();
            limits.touch(5.0, 0);
            blocks.insert(key.to_vec(), BlockEntry { global_rate: *rate, limits });
        }
        BlocksUpdate { tick, blocks: Arc::new(blocks), err_count: 0 }
    }

    #[tokio::test]
    async fn log_sink_accepts_updates() {
        let mut sink = LogSink;
        sink.call(update(1, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn memory_sink_orders_and_dedupes_by_tick() {
        let mut sink = MemorySink::new();
        sink.call(update(2, &[(b"a", 9.0)])).await.unwrap();
        sink.call(update(1, &[])).await.unwrap();
        // Tick 2 again, now with a different table: replaces, not appends.
        sink.call(update(2, &[(b"a", 12.0), (b"b", 7.0)])).await.unwrap();

        assert_eq!(sink.len(), 2);
        let history = sink.updates();
        assert_eq!(history[0].tick, 1);
        assert_eq!(history[1].tick, 2);
        assert_eq!(history[1].blocks.len(), 2);
        assert_eq!(sink.latest_rate(b"a"), Some(12.0));
        assert_eq!(sink.latest_rate(b"missing"), None);
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest_ticks_but_keeps_peak() {
        let mut sink = MemorySink::with_capacity(2);
        sink.call(update(1, &[(b"a", 9.0), (b"b", 8.0)])).await.unwrap();
        sink.call(update(2, &[])).await.unwrap();
        sink.call(update(3, &[(b"a", 6.0)])).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted_ticks(), 1);
        assert_eq!(sink.updates()[0].tick, 2);
        // The burst in tick 1 is gone from the history but not the peak.
        assert_eq!(sink.peak_blocked(), 2);
        assert_eq!(sink.latest().unwrap().tick, 3);
    }

    #[tokio::test]
    async fn memory_sink_clear_resets_everything() {
        let mut sink = MemorySink::with_capacity(1);
        sink.call(update(1, &[(b"a", 9.0)])).await.unwrap();
        sink.call(update(2, &[])).await.unwrap();
        assert_eq!(sink.evicted_ticks(), 1);

        sink.clear();
        assert!(sink.is_empty());
        assert_eq!(sink.peak_blocked(), 0);
        assert_eq!(sink.evicted_ticks(), 0);
        assert!(sink.latest().is_none());
    }
}
