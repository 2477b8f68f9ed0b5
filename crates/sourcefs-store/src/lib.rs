#![warn(missing_docs)]

//! SourceFS queued backing store.
//!
//! Coalesces content-addressed object fetches against a source-control
//! object store: a priority queue with type-homogeneous batching, a worker
//! pool, and a two-tier blob pipeline (local cache, then remote importer).

/// Error types and result handling.
pub mod error;
/// Per-stage import watch lists and scoped counters.
pub mod metrics;
/// Import request variants and completion sinks.
pub mod request;
/// Multi-producer / multi-consumer import priority queue.
pub mod queue;
/// The queued store: worker pool and batch processors.
pub mod queued_store;
/// Local store and remote importer contracts.
pub mod store;

pub use error::{Result, StoreError};
pub use metrics::{ImportMetrics, ImportObject, RequestMetricsScope, RequestStage};
pub use queued_store::{QueuedStore, StoreConfig};
pub use store::{LocalStore, RemoteImporter};
