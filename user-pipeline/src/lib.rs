//! Batched consume-and-flush pipeline: partition claims from a consumer group,
//! bounded per-partition queues, count/byte bounded batches, bulk sink flushes
//! and offset checkpoints that only advance past flushed work.

pub mod batch;
pub mod checkpoint;
pub mod claims;
pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod orchestrator;
pub mod probes;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod stats;
pub mod types;

// Used in "mod tests" and in the tests/ directory
pub mod test_utils;

pub use orchestrator::Pipeline;
pub use record::{Location, Record, User};
pub use sink::{BulkSink, SinkFlusher};
