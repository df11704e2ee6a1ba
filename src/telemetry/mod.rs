//! Telemetry for the rate limiter.
//!
//! After every aggregation interval the limiter broadcasts a
//! [`BlocksUpdate`] describing the freshly-installed block table; subscribe
//! with `RateLimiter::subscribe`, or attach a `BlocksSink` (a
//! `tower::Service<BlocksUpdate>`) and let the limiter forward updates from
//! a background task. [`LogSink`] emits one structured line per interval;
//! [`MemorySink`] keeps a bounded, tick-ordered history with peak tracking.
//!
//! This is operator telemetry only: the hot-path check never consults a sink,
//! and a slow sink can at worst lag the stream, never the limiter.

pub mod events;
pub mod sinks;

pub use events::BlocksUpdate;
pub use sinks::{BlocksSink, LogSink, MemorySink};
