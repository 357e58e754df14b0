use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use user_pipeline::config::{EnvMsDuration, PipelineConfig};
use user_pipeline::error::{PipelineError, SinkError};
use user_pipeline::record::{encode, Record, RecordKey, User};
use user_pipeline::shutdown::{ShutdownCoordinator, ShutdownState};
use user_pipeline::sink::BulkSink;
use user_pipeline::source::RawMessage;
use user_pipeline::test_utils::{
    raw_garbage, raw_user, raw_users, MemoryCheckpointer, MemorySource, RecordingSink, TEST_TOPIC,
};
use user_pipeline::types::Partition;
use user_pipeline::Pipeline;

fn partition(number: i32) -> Partition {
    Partition::new(TEST_TOPIC, number)
}

fn pipeline(
    config: PipelineConfig,
    sink: Arc<RecordingSink>,
    checkpointer: Arc<MemoryCheckpointer>,
    shutdown: ShutdownCoordinator,
) -> Pipeline<User> {
    Pipeline::new(config, TEST_TOPIC, sink, shutdown).with_checkpointer(checkpointer)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn flushes_full_batches_then_the_remainder() {
    let sink = Arc::new(RecordingSink::default());
    let checkpointer = Arc::new(MemoryCheckpointer::default());
    let shutdown = ShutdownCoordinator::new();
    let source = MemorySource::new(raw_users(0, 250));
    let released = source.released();

    let stats = pipeline(
        PipelineConfig::with_batch_size(100),
        sink.clone(),
        checkpointer.clone(),
        shutdown.clone(),
    )
    .run(source)
    .await
    .unwrap();

    assert_eq!(sink.flush_sizes(), vec![100, 100, 50]);
    assert_eq!(stats.received, 250);
    assert_eq!(stats.receive_errors, 0);
    assert_eq!(stats.flushed_records, 250);
    assert_eq!(stats.flushed_batches, 3);

    let committed: Vec<_> = checkpointer
        .positions()
        .iter()
        .map(|p| p.offset())
        .collect();
    assert_eq!(committed, vec![99, 199, 249]);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn shutdown_flushes_a_partial_batch_exactly_once() {
    let sink = Arc::new(RecordingSink::default());
    let checkpointer = Arc::new(MemoryCheckpointer::default());
    let shutdown = ShutdownCoordinator::new();
    let pipeline = pipeline(
        PipelineConfig::with_batch_size(100),
        sink.clone(),
        checkpointer.clone(),
        shutdown.clone(),
    );
    let stats = pipeline.stats();

    let running = tokio::spawn(pipeline.run(MemorySource::new(raw_users(0, 37)).hold_open()));
    wait_until("37 records received", || stats.snapshot().received == 37).await;
    assert!(sink.flush_sizes().is_empty());

    assert!(shutdown.begin_draining("test"));
    let stats = running.await.unwrap().unwrap();

    assert_eq!(sink.flush_sizes(), vec![37]);
    let unique: HashSet<_> = sink.flushed_keys().into_iter().collect();
    assert_eq!(unique.len(), 37);
    assert_eq!(stats.flushed_records, 37);
    assert_eq!(checkpointer.committed(&partition(0)), Some(36));
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn malformed_messages_do_not_block_the_partition() {
    let sink = Arc::new(RecordingSink::default());
    let checkpointer = Arc::new(MemoryCheckpointer::default());
    let messages = vec![
        raw_garbage(0, 0),
        raw_user(0, 1, 1),
        raw_garbage(0, 2),
        raw_user(0, 3, 3),
        raw_garbage(0, 4),
    ];

    let stats = pipeline(
        PipelineConfig::with_batch_size(100),
        sink.clone(),
        checkpointer.clone(),
        ShutdownCoordinator::new(),
    )
    .run(MemorySource::new(messages))
    .await
    .unwrap();

    assert_eq!(stats.received, 2);
    assert_eq!(stats.receive_errors, 3);
    assert_eq!(sink.flush_sizes(), vec![2]);
    assert_eq!(
        sink.flushed_keys(),
        vec![RecordKey::Int(1), RecordKey::Int(3)]
    );

    // The leading bad message is acknowledged on its own, the trailing one
    // together with the batch that was resident when it arrived
    let committed: Vec<_> = checkpointer
        .positions()
        .iter()
        .map(|p| p.offset())
        .collect();
    assert_eq!(committed, vec![0, 4]);
}

#[tokio::test]
async fn unknown_birth_dates_are_stored_as_absent() {
    let sink = Arc::new(RecordingSink::default());
    let mut user = User::new(12);
    user.dob = Some("0000-00-00".to_string());
    let mut dated = User::new(13);
    dated.dob = Some("1984-02-29".to_string());

    let messages: Vec<RawMessage> = [user, dated]
        .iter()
        .enumerate()
        .map(|(offset, user)| RawMessage {
            partition: partition(0),
            offset: offset as i64,
            payload: Some(encode(user).unwrap()),
        })
        .collect();

    pipeline(
        PipelineConfig::with_batch_size(10),
        sink.clone(),
        Arc::new(MemoryCheckpointer::default()),
        ShutdownCoordinator::new(),
    )
    .run(MemorySource::new(messages))
    .await
    .unwrap();

    let stored = sink.stored();
    assert_eq!(stored[&RecordKey::Int(12)].dob, None);
    assert_eq!(stored[&RecordKey::Int(13)].dob.as_deref(), Some("1984-02-29"));
}

#[tokio::test]
async fn partitions_are_batched_and_checkpointed_independently() {
    let sink = Arc::new(RecordingSink::default());
    let checkpointer = Arc::new(MemoryCheckpointer::default());
    let mut messages = Vec::new();
    for offset in 0..30 {
        for number in 0..3 {
            messages.push(raw_user(number, offset, i64::from(number) * 1000 + offset));
        }
    }

    let stats = pipeline(
        PipelineConfig::with_batch_size(10),
        sink.clone(),
        checkpointer.clone(),
        ShutdownCoordinator::new(),
    )
    .run(MemorySource::new(messages))
    .await
    .unwrap();

    assert_eq!(stats.received, 90);
    assert_eq!(sink.flush_sizes(), vec![10; 9]);
    for number in 0..3 {
        assert_eq!(checkpointer.committed(&partition(number)), Some(29));
    }
    assert_eq!(sink.stored().len(), 90);
}

#[tokio::test]
async fn redelivered_records_upsert_in_place() {
    let sink = Arc::new(RecordingSink::default());

    for _ in 0..2 {
        pipeline(
            PipelineConfig::with_batch_size(4),
            sink.clone(),
            Arc::new(MemoryCheckpointer::default()),
            ShutdownCoordinator::new(),
        )
        .run(MemorySource::new(raw_users(0, 10)))
        .await
        .unwrap();
    }

    assert_eq!(sink.flushed_keys().len(), 20);
    assert_eq!(sink.stored().len(), 10);
}

#[tokio::test]
async fn fatal_flush_error_stops_the_pipeline_without_checkpointing() {
    let sink = Arc::new(RecordingSink::default());
    sink.fail_always(SinkError::Fatal("index closed".to_string()));
    let checkpointer = Arc::new(MemoryCheckpointer::default());
    let shutdown = ShutdownCoordinator::new();
    let pipeline = pipeline(
        PipelineConfig::with_batch_size(5),
        sink.clone(),
        checkpointer.clone(),
        shutdown.clone(),
    );
    let stats = pipeline.stats();

    let result = pipeline
        .run(MemorySource::new(raw_users(0, 20)).hold_open())
        .await;

    assert!(matches!(result, Err(PipelineError::Flush(_))));
    assert!(checkpointer.positions().is_empty());
    assert!(sink.stored().is_empty());
    assert!(stats.snapshot().flush_errors >= 1);
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn retryable_flush_errors_are_retried_when_allowed() {
    let sink = Arc::new(RecordingSink::default());
    sink.fail_next(2, SinkError::Retryable("429 Too Many Requests".to_string()));
    let mut config = PipelineConfig::with_batch_size(10);
    config.flush_retry.flush_max_retries = 3;
    config.flush_retry.flush_backoff_initial_ms = EnvMsDuration(Duration::from_millis(1));

    let stats = pipeline(
        config,
        sink.clone(),
        Arc::new(MemoryCheckpointer::default()),
        ShutdownCoordinator::new(),
    )
    .run(MemorySource::new(raw_users(0, 10)))
    .await
    .unwrap();

    assert_eq!(sink.flush_sizes(), vec![10]);
    assert_eq!(stats.flush_retries, 2);
    assert_eq!(stats.flush_errors, 0);
}

#[tokio::test]
async fn revoked_claim_drains_and_tolerates_lost_ownership() {
    let sink = Arc::new(RecordingSink::default());
    let checkpointer = Arc::new(MemoryCheckpointer::default());
    let shutdown = ShutdownCoordinator::new();
    let pipeline = pipeline(
        PipelineConfig::with_batch_size(100),
        sink.clone(),
        checkpointer.clone(),
        shutdown.clone(),
    );
    let registry = pipeline.registry();
    let stats = pipeline.stats();
    assert_eq!(registry.setup(&[partition(0)]), 1);

    let running = tokio::spawn(pipeline.run(MemorySource::new(raw_users(0, 5)).hold_open()));
    wait_until("5 records received", || stats.snapshot().received == 5).await;

    // The partition already belongs to someone else when the final flush lands
    checkpointer.reject(partition(0));
    assert_eq!(registry.revoke(&[partition(0)]), 1);
    wait_until("revoked batch flushed", || sink.flush_sizes() == vec![5]).await;
    assert!(registry.claimed_partitions().is_empty());

    shutdown.begin_draining("test");
    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.checkpoint_errors, 1);
    assert_eq!(stats.flushed_records, 5);
}

struct StuckSink;

#[async_trait]
impl BulkSink<User> for StuckSink {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn write_batch(&self, _: &[Record<User>]) -> Result<(), SinkError> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn gives_up_when_draining_takes_too_long() {
    let shutdown = ShutdownCoordinator::new();
    let mut config = PipelineConfig::with_batch_size(1);
    config.shutdown_timeout_ms = EnvMsDuration(Duration::from_millis(50));
    let pipeline =
        Pipeline::<User>::new(config, TEST_TOPIC, Arc::new(StuckSink), shutdown.clone());
    let stats = pipeline.stats();

    let running = tokio::spawn(pipeline.run(MemorySource::new(raw_users(0, 1)).hold_open()));
    wait_until("record received", || stats.snapshot().received == 1).await;

    shutdown.begin_draining("test");
    let result = running.await.unwrap();
    assert!(matches!(result, Err(PipelineError::DrainTimeout(_))));
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn full_queue_holds_back_the_reader() {
    let shutdown = ShutdownCoordinator::new();
    let mut config = PipelineConfig::with_batch_size(1);
    config.queue_capacity = 2;
    config.shutdown_timeout_ms = EnvMsDuration(Duration::from_millis(50));
    let pipeline =
        Pipeline::<User>::new(config, TEST_TOPIC, Arc::new(StuckSink), shutdown.clone());
    let stats = pipeline.stats();

    let running = tokio::spawn(pipeline.run(MemorySource::new(raw_users(0, 1000))));
    // One record is stuck in the worker's flush and two fill the queue
    wait_until("queue filled", || stats.snapshot().received == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stats.snapshot().received, 3);

    shutdown.begin_draining("test");
    let result = running.await.unwrap();
    assert!(matches!(result, Err(PipelineError::DrainTimeout(_))));
}

struct PanickingSink;

#[async_trait]
impl BulkSink<User> for PanickingSink {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn write_batch(&self, _: &[Record<User>]) -> Result<(), SinkError> {
        panic!("sink blew up")
    }
}

#[tokio::test]
async fn panicking_worker_fails_the_pipeline() {
    let shutdown = ShutdownCoordinator::new();
    let pipeline = Pipeline::<User>::new(
        PipelineConfig::with_batch_size(5),
        TEST_TOPIC,
        Arc::new(PanickingSink),
        shutdown.clone(),
    );

    let result = pipeline
        .run(MemorySource::new(raw_users(0, 10)).hold_open())
        .await;

    assert!(matches!(result, Err(PipelineError::Worker(_))));
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}
