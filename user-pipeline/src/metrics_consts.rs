// ==== Stream reader metrics, labelled by source topic ====
/// Counter for records decoded and handed to a partition queue
pub const RECORDS_RECEIVED: &str = "user_pipeline_records_received_total";

/// Counter for messages that could not be read or decoded
pub const RECEIVE_ERRORS: &str = "user_pipeline_receive_errors_total";

// ==== Sink flusher metrics, labelled by sink name ====
/// Counter for records delivered to the sink
pub const RECORDS_FLUSHED: &str = "user_pipeline_records_flushed_total";

/// Counter for batches delivered to the sink
pub const BATCHES_FLUSHED: &str = "user_pipeline_batches_flushed_total";

/// Counter for batches the sink finally rejected
pub const FLUSH_ERRORS: &str = "user_pipeline_flush_errors_total";

/// Counter for flush attempts repeated after a retryable error
pub const FLUSH_RETRIES: &str = "user_pipeline_flush_retries_total";

/// Histogram for one bulk write, in milliseconds
pub const FLUSH_DURATION: &str = "user_pipeline_flush_duration_ms";

// ==== Checkpoint metrics ====
/// Counter for offsets that could not be stored for commit
pub const CHECKPOINT_ERRORS: &str = "user_pipeline_checkpoint_errors_total";

/// Gauge for the number of partitions currently claimed
pub const CLAIMED_PARTITIONS: &str = "user_pipeline_claimed_partitions";
