use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::Partition;

/// A payload that cannot become a record. The message is skipped, never retried.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("source error: {0}")]
    Other(String),
}

/// Errors returned by a single bulk write. Only retryable errors are worth
/// another attempt with the same batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("retryable sink error: {0}")]
    Retryable(String),
    #[error("fatal sink error: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable(_))
    }
}

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("refusing to flush an empty batch")]
    EmptyBatch,
    #[error("{sink} failed to write a batch of {records} after {attempts} attempts: {error}")]
    Failed {
        sink: String,
        records: usize,
        attempts: u32,
        #[source]
        error: SinkError,
    },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("partition {0} is not claimed by this consumer")]
    NotClaimed(Partition),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error("pipeline did not drain within {0:?}")]
    DrainTimeout(Duration),
    #[error("stream reader task failed: {0}")]
    Reader(String),
    #[error("partition worker failed: {0}")]
    Worker(String),
}
