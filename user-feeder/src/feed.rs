use std::sync::atomic::{AtomicU64, Ordering};

use common_kafka::kafka_producer::{produce_json_batch, KafkaContext};
use rdkafka::producer::FutureProducer;
use tokio::sync::mpsc;
use tracing::{info, warn};
use user_pipeline::User;

use crate::config::SourceKind;
use crate::metrics_consts::{READ_ERRORS, SEND_ERRORS, USERS_READ, USERS_SENT};

/// Read and send counters for one feed run, mirrored into metrics.
pub struct FeedStats {
    read: AtomicU64,
    read_errors: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
    source_labels: Vec<(String, String)>,
    topic_labels: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedTotals {
    pub read: u64,
    pub read_errors: u64,
    pub sent: u64,
    pub send_errors: u64,
}

impl FeedStats {
    pub fn new(source: SourceKind, topic: &str) -> Self {
        Self {
            read: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            source_labels: vec![("source".to_string(), source.to_string())],
            topic_labels: vec![("topic".to_string(), topic.to_string())],
        }
    }

    pub fn user_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(USERS_READ, &self.source_labels, 1);
    }

    pub fn read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(READ_ERRORS, &self.source_labels, 1);
    }

    fn users_sent(&self, count: usize) {
        self.sent.fetch_add(count as u64, Ordering::Relaxed);
        common_metrics::inc(USERS_SENT, &self.topic_labels, count as u64);
    }

    fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        common_metrics::inc(SEND_ERRORS, &self.topic_labels, 1);
    }

    pub fn totals(&self) -> FeedTotals {
        FeedTotals {
            read: self.read.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Produces `users` to `topic` as JSON keyed by id and waits for every ack.
/// Returns how many could not be sent.
pub async fn send_users(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    users: &[User],
    stats: &FeedStats,
) -> usize {
    let report =
        produce_json_batch(producer, topic, users, |user: &User| user.id.to_string()).await;

    stats.users_sent(report.delivered);
    let failed = report.failed.len();
    for (index, e) in report.failed {
        warn!(topic, id = users[index].id, "failed to send user: {}", e);
        stats.send_error();
    }
    failed
}

/// Produces users to `topic`, `chunk_size` at a time, until every reader has
/// dropped its sender. Failed sends are counted and skipped.
pub async fn pump(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    mut users: mpsc::Receiver<User>,
    chunk_size: usize,
    stats: &FeedStats,
) {
    let chunk_size = chunk_size.max(1);
    let mut chunk = Vec::with_capacity(chunk_size);

    while users.recv_many(&mut chunk, chunk_size).await > 0 {
        send_users(producer, topic, &chunk, stats).await;
        chunk.clear();

        let totals = stats.totals();
        info!(
            topic,
            sent = totals.sent,
            send_errors = totals.send_errors,
            "produced users"
        );
    }
}
