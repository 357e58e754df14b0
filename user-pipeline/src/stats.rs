use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics_consts::{
    BATCHES_FLUSHED, CHECKPOINT_ERRORS, FLUSH_ERRORS, FLUSH_RETRIES, RECEIVE_ERRORS,
    RECORDS_FLUSHED, RECORDS_RECEIVED,
};

/// Process-wide counters, mirrored into the metrics recorder with source / sink
/// labels. The atomics let callers and tests read totals back.
#[derive(Debug)]
pub struct PipelineStats {
    source_labels: Vec<(String, String)>,
    sink_labels: Vec<(String, String)>,
    received: AtomicU64,
    receive_errors: AtomicU64,
    flushed_records: AtomicU64,
    flushed_batches: AtomicU64,
    flush_errors: AtomicU64,
    flush_retries: AtomicU64,
    checkpoint_errors: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub receive_errors: u64,
    pub flushed_records: u64,
    pub flushed_batches: u64,
    pub flush_errors: u64,
    pub flush_retries: u64,
    pub checkpoint_errors: u64,
}

impl PipelineStats {
    pub fn new(source: &str, sink: &str) -> Self {
        Self {
            source_labels: vec![("source".to_string(), source.to_string())],
            sink_labels: vec![("sink".to_string(), sink.to_string())],
            received: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            flushed_records: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            flush_retries: AtomicU64::new(0),
            checkpoint_errors: AtomicU64::new(0),
        }
    }

    pub fn sink_labels(&self) -> &[(String, String)] {
        &self.sink_labels
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(RECORDS_RECEIVED, &self.source_labels, 1);
    }

    pub fn receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(RECEIVE_ERRORS, &self.source_labels, 1);
    }

    pub fn batch_flushed(&self, records: usize) {
        let records = records as u64;
        self.flushed_records.fetch_add(records, Ordering::Relaxed);
        self.flushed_batches.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(RECORDS_FLUSHED, &self.sink_labels, records);
        common_metrics::inc(BATCHES_FLUSHED, &self.sink_labels, 1);
    }

    pub fn flush_error(&self) {
        self.flush_errors.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(FLUSH_ERRORS, &self.sink_labels, 1);
    }

    pub fn flush_retry(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(FLUSH_RETRIES, &self.sink_labels, 1);
    }

    pub fn checkpoint_error(&self) {
        self.checkpoint_errors.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(CHECKPOINT_ERRORS, &self.source_labels, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            flushed_records: self.flushed_records.load(Ordering::Relaxed),
            flushed_batches: self.flushed_batches.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            checkpoint_errors: self.checkpoint_errors.load(Ordering::Relaxed),
        }
    }
}
