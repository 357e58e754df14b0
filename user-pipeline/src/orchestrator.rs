//! Per-partition workers and the pipeline that supervises them.
//!
//! Each claimed partition gets one task running a [`PartitionWorker`]. The
//! worker owns the accumulator for its partition, so nothing on the hot path is
//! shared: it dequeues a delivery, adds records to the batch, flushes completed
//! batches and advances the partition checkpoint past what was flushed.
//!
//! When the claim is cancelled (revoke or shutdown) or its queue closes, the
//! worker drains: it processes whatever is still queued and flushes the resident
//! batch regardless of the count threshold, so no buffered record is dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchAccumulator, BatchLimits};
use crate::checkpoint::{Checkpointer, OffsetCheckpoint};
use crate::claims::{Claim, ClaimRegistry, ClaimedPartition};
use crate::config::PipelineConfig;
use crate::error::{FlushError, PipelineError};
use crate::record::{Decode, Identified};
use crate::shutdown::ShutdownCoordinator;
use crate::sink::{BulkSink, SinkFlusher};
use crate::source::{Delivery, MessageSource, StreamReader};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::{Partition, SourcePosition};

/// What a worker handled before it exited cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub partition: Partition,
    pub generation: u64,
    pub batches: u64,
    pub committed: Option<i64>,
}

pub struct PartitionWorker<T> {
    claim: Claim,
    receiver: mpsc::Receiver<Delivery<T>>,
    accumulator: BatchAccumulator<T>,
    flusher: Arc<SinkFlusher<T>>,
    checkpointer: Arc<dyn Checkpointer>,
    checkpoint: OffsetCheckpoint,
    // Highest malformed position seen while a batch was resident, acknowledged with that batch
    pending_skip: Option<SourcePosition>,
    stats: Arc<PipelineStats>,
    batches: u64,
}

impl<T: Send + Sync + 'static> PartitionWorker<T> {
    pub fn new(
        claimed: ClaimedPartition<T>,
        limits: BatchLimits,
        flusher: Arc<SinkFlusher<T>>,
        checkpointer: Arc<dyn Checkpointer>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let checkpoint = OffsetCheckpoint::new(claimed.claim.partition().clone());
        Self {
            claim: claimed.claim,
            receiver: claimed.receiver,
            accumulator: BatchAccumulator::new(limits),
            flusher,
            checkpointer,
            checkpoint,
            pending_skip: None,
            stats,
            batches: 0,
        }
    }

    pub async fn run(mut self) -> Result<WorkerSummary, FlushError> {
        info!(
            partition = %self.claim.partition(),
            generation = self.claim.generation(),
            "starting partition worker"
        );

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.claim.cancelled() => break,
                delivery = self.receiver.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.handle(delivery).await?;
        }

        self.drain().await
    }

    async fn handle(&mut self, delivery: Delivery<T>) -> Result<(), FlushError> {
        match delivery {
            Delivery::Record(record) => {
                if let Some(batch) = self.accumulator.add(record) {
                    self.flush(batch).await?;
                }
            }
            Delivery::Skipped(position) => {
                if self.accumulator.is_empty() {
                    self.commit(&position);
                } else {
                    self.pending_skip = Some(position);
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self, batch: Batch<T>) -> Result<(), FlushError> {
        let receipt = self.flusher.flush(&batch, self.claim.token()).await?;
        drop(batch);
        self.batches += 1;

        debug!(
            partition = %self.claim.partition(),
            batch_size = receipt.records,
            attempts = receipt.attempts,
            "flushed batch"
        );

        // A skipped position recorded while the flushed batch was resident can't be
        // ahead of any record still buffered, so the larger of the two is safe
        let covered = match (receipt.checkpoint, self.pending_skip.take()) {
            (Some(flushed), Some(skipped)) if skipped.offset() > flushed.offset() => {
                Some(skipped)
            }
            (Some(flushed), _) => Some(flushed),
            (None, skipped) => skipped,
        };
        if let Some(position) = covered {
            self.commit(&position);
        }
        Ok(())
    }

    fn commit(&mut self, position: &SourcePosition) {
        if !self.checkpoint.advance(position.offset()) {
            return;
        }
        if let Err(e) = self.checkpointer.checkpoint(position) {
            // Usually the partition moved to another consumer, which re-reads from
            // the last committed offset
            warn!(
                topic = position.topic(),
                partition = position.partition_number(),
                offset = position.offset(),
                "failed to checkpoint: {}",
                e
            );
            self.stats.checkpoint_error();
        }
    }

    async fn drain(mut self) -> Result<WorkerSummary, FlushError> {
        self.receiver.close();
        let mut drained = 0;
        while let Ok(delivery) = self.receiver.try_recv() {
            drained += 1;
            self.handle(delivery).await?;
        }

        if let Some(batch) = self.accumulator.take() {
            info!(
                partition = %self.claim.partition(),
                batch_size = batch.len(),
                "flushing resident batch before exit"
            );
            self.flush(batch).await?;
        }
        // Only possible when nothing was resident at the last skip
        if let Some(skipped) = self.pending_skip.take() {
            self.commit(&skipped);
        }

        info!(
            partition = %self.claim.partition(),
            generation = self.claim.generation(),
            drained,
            batches = self.batches,
            committed = self.checkpoint.committed(),
            "partition worker stopped"
        );
        Ok(WorkerSummary {
            partition: self.claim.partition().clone(),
            generation: self.claim.generation(),
            batches: self.batches,
            committed: self.checkpoint.committed(),
        })
    }
}

/// Wires a message source, the claim registry, one worker per claim and a
/// sink together, and runs them until the source ends or shutdown completes.
pub struct Pipeline<T> {
    config: PipelineConfig,
    registry: Arc<ClaimRegistry<T>>,
    claimed_rx: mpsc::UnboundedReceiver<ClaimedPartition<T>>,
    flusher: Arc<SinkFlusher<T>>,
    checkpointer: Arc<dyn Checkpointer>,
    stats: Arc<PipelineStats>,
    shutdown: ShutdownCoordinator,
}

impl<T> Pipeline<T>
where
    T: Decode + Identified + Send + Sync + 'static,
{
    pub fn new(
        config: PipelineConfig,
        source_label: &str,
        sink: Arc<dyn BulkSink<T>>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new(source_label, sink.name()));
        let (registry, claimed_rx) = ClaimRegistry::new(config.queue_capacity, shutdown.token());
        let flusher = Arc::new(SinkFlusher::new(sink, config.retry_policy(), stats.clone()));

        Self {
            config,
            registry,
            claimed_rx,
            flusher,
            checkpointer: Arc::new(NoopCheckpointer),
            stats,
            shutdown,
        }
    }

    /// Sets where flushed progress is committed. The checkpointer usually comes
    /// from the source, which needs [`Pipeline::registry`] to be built first.
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    pub fn registry(&self) -> Arc<ClaimRegistry<T>> {
        self.registry.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Runs until the source is exhausted or shutdown is requested and every
    /// worker has drained. A batch the sink finally rejects stops the whole
    /// pipeline and is returned as the error, after the other workers drained.
    /// A worker that panics is reported the same way.
    pub async fn run<S>(mut self, source: S) -> Result<StatsSnapshot, PipelineError>
    where
        S: MessageSource + 'static,
    {
        let token = self.shutdown.token();
        let reader = StreamReader::new(self.registry.clone(), self.stats.clone());
        let mut reader_task = tokio::spawn(reader.run(source, token.clone()));
        let mut source = None;

        let drain_timeout = self.config.shutdown_timeout_ms.0;
        let drain_deadline = {
            let token = token.clone();
            async move {
                token.cancelled().await;
                tokio::time::sleep(drain_timeout).await;
            }
        };
        tokio::pin!(drain_deadline);

        let mut ready = self.registry.subscribe_ready();
        let mut workers = JoinSet::new();
        let mut fatal: Option<PipelineError> = None;
        let mut reader_done = false;

        loop {
            tokio::select! {
                biased;
                Some(claimed) = self.claimed_rx.recv() => {
                    self.spawn_worker(&mut workers, claimed);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.on_worker_exit(joined, &mut fatal);
                }
                joined = &mut reader_task, if !reader_done => {
                    reader_done = true;
                    match joined {
                        Ok(returned) => source = Some(returned),
                        Err(e) => {
                            error!("stream reader task failed: {}", e);
                            self.shutdown.begin_draining("stream reader failed");
                            return self.abort(workers, PipelineError::Reader(e.to_string())).await;
                        }
                    }
                }
                Ok(()) = ready.changed() => {
                    let generation = *ready.borrow_and_update();
                    info!(generation, "consumer claims ready");
                }
                _ = &mut drain_deadline => {
                    error!(
                        timeout_ms = drain_timeout.as_millis() as u64,
                        "pipeline did not drain in time"
                    );
                    reader_task.abort();
                    return self.abort(workers, PipelineError::DrainTimeout(drain_timeout)).await;
                }
            }

            if reader_done {
                // Claims announced before the reader closed every queue still need a
                // worker to drain them
                while let Ok(claimed) = self.claimed_rx.try_recv() {
                    self.spawn_worker(&mut workers, claimed);
                }
                if workers.is_empty() {
                    break;
                }
            }
        }

        if let Some(mut source) = source {
            source.release().await;
        }
        self.shutdown.mark_stopped();

        let snapshot = self.stats.snapshot();
        info!(
            received = snapshot.received,
            receive_errors = snapshot.receive_errors,
            flushed = snapshot.flushed_records,
            batches = snapshot.flushed_batches,
            flush_errors = snapshot.flush_errors,
            "pipeline stopped"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Result<WorkerSummary, FlushError>>,
        claimed: ClaimedPartition<T>,
    ) {
        let worker = PartitionWorker::new(
            claimed,
            self.config.batch_limits(),
            self.flusher.clone(),
            self.checkpointer.clone(),
            self.stats.clone(),
        );
        workers.spawn(worker.run());
    }

    fn on_worker_exit(
        &self,
        joined: Result<Result<WorkerSummary, FlushError>, JoinError>,
        fatal: &mut Option<PipelineError>,
    ) {
        match joined {
            Ok(Ok(summary)) => {
                debug!(
                    partition = %summary.partition,
                    batches = summary.batches,
                    "worker exited"
                );
            }
            Ok(Err(e)) => {
                error!(
                    sink = self.flusher.sink_name(),
                    "stopping pipeline after flush failure: {}", e
                );
                self.shutdown.begin_draining("flush failed");
                fatal.get_or_insert(PipelineError::Flush(e));
            }
            Err(e) => {
                error!("partition worker panicked: {}", e);
                self.shutdown.begin_draining("partition worker panicked");
                fatal.get_or_insert(PipelineError::Worker(e.to_string()));
            }
        }
    }

    async fn abort(
        &self,
        mut workers: JoinSet<Result<WorkerSummary, FlushError>>,
        error: PipelineError,
    ) -> Result<StatsSnapshot, PipelineError> {
        workers.shutdown().await;
        self.shutdown.mark_stopped();
        Err(error)
    }
}

/// Used until a real checkpointer is set, e.g. for sources without offsets
struct NoopCheckpointer;

impl Checkpointer for NoopCheckpointer {
    fn checkpoint(&self, _: &SourcePosition) -> Result<(), crate::error::CheckpointError> {
        Ok(())
    }
}
