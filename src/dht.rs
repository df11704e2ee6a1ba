//! The DHT capability consumed by the rate limiter.
//!
//! The limiter never talks to routing tables or sockets directly; it sees a
//! distributed counter map through two operations. `put` must drive the
//! storage adapter's decay-then-add and return the post-write value, because
//! the controller uses that return as a cheap consistent read of the global
//! count. `get` must reduce whatever replicas answer into one value via the
//! decayed-maximum merge.
//!
//! [`crate::transport::UdpDht`] is the wire-backed implementation;
//! [`InProcessDht`] serves single-process clusters and deterministic tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::counter::CounterStore;

/// Core interface for distributed counter access.
///
/// This trait decouples the controller from the transport, so a limiter can
/// run over UDP peers, a shared in-process store, or anything else that can
/// keep an eventually-consistent decaying count.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Add `delta` to the counter for `key` and return the post-write value.
    async fn put(
        &self,
        key: &[u8],
        delta: f64,
    ) -> Result<f64, Box<dyn std::error::Error + Send + Sync>>;

    /// The merged cluster-wide value for `key`, or 0 when no replica has it.
    async fn get(&self, key: &[u8]) -> Result<f64, Box<dyn std::error::Error + Send + Sync>>;
}

/// A `Dht` backed by one shared in-process counter store.
///
/// Clones share the store, so several limiters handed clones of one
/// `InProcessDht` behave like a fully converged cluster: every put is
/// immediately visible to every node. Used by tests and by embedders that
/// want the limiter semantics without the peer layer.
#[derive(Debug, Clone)]
pub struct InProcessDht {
    store: Arc<CounterStore>,
    clock: Arc<dyn Clock>,
}

impl InProcessDht {
    pub fn new(half_life: Duration, min_value: f64, clock: Arc<dyn Clock>) -> Self {
        Self { store: Arc::new(CounterStore::new(half_life, min_value)), clock }
    }

    /// The shared store, for inspection in tests.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }
}

#[async_trait]
impl Dht for InProcessDht {
    async fn put(
        &self,
        key: &[u8],
        delta: f64,
    ) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
        let now = self.clock.now_millis();
        let value = self.store.add(key, delta, now);
        self.store.sweep(now);
        Ok(value)
    }

    async fn get(&self, key: &[u8]) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.store.value(key, self.clock.now_millis()))
    }
}
