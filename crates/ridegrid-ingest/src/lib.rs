//! ridegrid-ingest — location ingestion pipeline.
//!
//! Driver GPS samples land in an in-memory [`LocationBuffer`] guarded per
//! driver. A flush loop moves them into the shared KV store (presence,
//! geo index, recent history) and a slower persistence loop writes them to
//! the durable [`SampleSink`](ridegrid_state::SampleSink).

pub mod backoff;
pub mod buffer;
pub mod error;
pub mod pipeline;
pub mod stats;

pub use backoff::FlushTracker;
pub use buffer::{Accepted, DriverBatch, LocationBuffer};
pub use error::{QuotaReason, SubmitError};
pub use pipeline::{FlushReport, LocationPipeline};
pub use stats::{IngestStats, IngestStatsSnapshot};
