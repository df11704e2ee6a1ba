#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! A distributed rate limiter whose hot-path check is a purely local,
//! synchronous decision. Request-rate accounting is aggregated across a
//! cluster of peer nodes through a DHT of exponentially decaying counters,
//! and each node caches the keys whose cluster-wide rate exceeds a limit.
//!
//! ## Features
//!
//! - **O(1) synchronous checks**: no I/O, no await, no timeout on the
//!   request path
//! - **Decaying counters** with a half-life of one aggregation interval;
//!   replicas merge by decayed maximum
//! - **Master-port election** so seed lists stay stable while many nodes
//!   share a host
//! - **Multiple limits per key**, decided against the minimum recently
//!   active one
//! - **Blocks telemetry** as a broadcast stream or tower-service sinks
//!
//! The answers are deliberately approximate and biased toward blocking near
//! the limit; what the system buys with that is a check that never waits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use floodgate::{LimiterConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floodgate::LimiterError> {
//!     let mut config = LimiterConfig::default();
//!     config.seeds = vec!["limits-1.internal".into(), "limits-2.internal".into()];
//!
//!     let limiter = RateLimiter::new(config)?;
//!     limiter.setup().await?;
//!
//!     // 100 requests/second, cluster-wide, for this client.
//!     if limiter.check(b"client-42", 100.0) {
//!         // handle the request
//!     }
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod counter;
pub mod dht;
pub mod error;
pub mod jitter;
pub mod limiter;
pub mod middleware;
pub mod sleeper;
pub mod table;
pub mod telemetry;
pub mod transport;

use std::time::Duration;

/// The conventional master port, also the default for bare seed addresses.
pub const DEFAULT_PORT: u16 = 3050;

/// Default aggregation interval; doubles as the counter half-life.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10_000);

/// Default eviction threshold for decayed counters.
pub const DEFAULT_MIN_VALUE: f64 = 0.1;

/// How long a limit stays active after it was last asked about, in
/// milliseconds.
pub const LIMIT_ACTIVE_WINDOW: u64 = 600_000;

/// Raw counters divide by this on the way to requests/second. 2.2 rather
/// than the exact 2.0, so the estimate errs toward blocking.
pub const RATE_SAFETY_DIVISOR: f64 = 2.2;

/// The maximum number of in-flight DHT operations per interval tick.
pub const FANOUT_CONCURRENCY: usize = 50;

/// Bind attempts on random fallback ports after losing the master port.
pub const BIND_ATTEMPTS: usize = 5;

/// A non-master node probes the master port every this many intervals.
pub const RECONNECT_INTERVAL_FACTOR: u32 = 60;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterStore, DecayingCounter};
pub use dht::{Dht, InProcessDht};
pub use error::LimiterError;
pub use jitter::Jitter;
pub use limiter::{LimiterConfig, Listen, RateLimiter};
pub use middleware::{GateError, GateLayer, GateService};
/// Sleep abstractions: `Sleeper` trait, `TokioSleeper` for production, `GatedSleeper` for tests.
pub use sleeper::{GatedSleeper, Sleeper, TokioSleeper};
pub use table::{BlockEntry, BlockMap, Limits};
pub use telemetry::{BlocksSink, BlocksUpdate, LogSink, MemorySink};
pub use transport::{Seed, UdpDht};
