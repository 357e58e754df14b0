use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::batch::Batch;
use crate::error::{FlushError, SinkError};
use crate::metrics_consts::FLUSH_DURATION;
use crate::record::Record;
use crate::retry::RetryPolicy;
use crate::stats::PipelineStats;
use crate::types::SourcePosition;

/// A downstream store that accepts grouped writes. Writes are upserts keyed by
/// record identity, so writing the same records twice leaves the same state.
#[async_trait]
pub trait BulkSink<T>: Send + Sync {
    /// Label for logs and metrics
    fn name(&self) -> &str;

    async fn write_batch(&self, records: &[Record<T>]) -> Result<(), SinkError>;
}

/// Outcome of a successful flush. `checkpoint` is the highest position the
/// batch covered, it is safe to commit past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReceipt {
    pub records: usize,
    pub attempts: u32,
    pub checkpoint: Option<SourcePosition>,
}

pub struct SinkFlusher<T> {
    sink: Arc<dyn BulkSink<T>>,
    retry_policy: RetryPolicy,
    stats: Arc<PipelineStats>,
}

impl<T> SinkFlusher<T> {
    pub fn new(
        sink: Arc<dyn BulkSink<T>>,
        retry_policy: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            sink,
            retry_policy,
            stats,
        }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Writes the batch, retrying retryable errors as the policy allows. The
    /// batch is only borrowed; callers drop it once this returns Ok.
    ///
    /// Backoff waits end early when `cancel` fires, and the batch is reported as
    /// failed with the last error. Its records stay uncommitted.
    pub async fn flush(
        &self,
        batch: &Batch<T>,
        cancel: &CancellationToken,
    ) -> Result<FlushReceipt, FlushError> {
        if batch.is_empty() {
            return Err(FlushError::EmptyBatch);
        }

        let mut retry = 0;
        loop {
            let timer = common_metrics::timing_guard(FLUSH_DURATION, self.stats.sink_labels());
            let result = self.sink.write_batch(batch.records()).await;
            timer.fin();

            match result {
                Ok(()) => {
                    self.stats.batch_flushed(batch.len());
                    return Ok(FlushReceipt {
                        records: batch.len(),
                        attempts: retry + 1,
                        checkpoint: batch.last_position().cloned(),
                    });
                }
                Err(e) if e.is_retryable() && self.retry_policy.should_retry(retry) => {
                    retry += 1;
                    let wait = self.retry_policy.retry_interval(retry);
                    self.stats.flush_retry();
                    warn!(
                        sink = self.sink.name(),
                        batch_size = batch.len(),
                        retry,
                        wait_ms = wait.as_millis() as u64,
                        "retrying batch after error: {}",
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.stats.flush_error();
                            warn!(
                                sink = self.sink.name(),
                                batch_size = batch.len(),
                                retry,
                                "giving up on batch, retries cancelled"
                            );
                            return Err(FlushError::Failed {
                                sink: self.sink.name().to_string(),
                                records: batch.len(),
                                attempts: retry,
                                error: e,
                            });
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => {
                    self.stats.flush_error();
                    error!(
                        sink = self.sink.name(),
                        batch_size = batch.len(),
                        first_offset = batch.records().first().map(|r| r.position().offset()),
                        last_offset = batch.last_position().map(SourcePosition::offset),
                        "failed to flush batch: {}",
                        e
                    );
                    return Err(FlushError::Failed {
                        sink: self.sink.name().to_string(),
                        records: batch.len(),
                        attempts: retry + 1,
                        error: e,
                    });
                }
            }
        }
    }
}
