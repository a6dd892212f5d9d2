//! Shardstore tiering - the migration controller
//!
//! Consumes the ordered, at-least-once stream of tiering
//! recommendations, filters them, and runs bounded-concurrency
//! migrations against the metadata service. The in-memory queue is
//! deliberately lossy on overflow: the upstream log retains events and
//! future recommendations re-express anything dropped, so backpressure
//! shows up as consumer lag instead of a stalled event loop.

pub mod controller;
pub mod counters;
pub mod stream;

pub use controller::{MetaMigrationDriver, MigrationDriver, TierController, TierControllerConfig};
pub use counters::TierCounters;
pub use stream::{EventStream, JsonlEventStream, MemoryEventStream, StreamRecord};
