//! In-memory sources, sinks and checkpointers for exercising the pipeline
//! without a broker or a downstream store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::checkpoint::Checkpointer;
use crate::error::{CheckpointError, SinkError, SourceError};
use crate::record::{encode, Record, RecordKey, User};
use crate::sink::BulkSink;
use crate::source::{MessageSource, RawMessage};
use crate::types::{Partition, SourcePosition};

pub const TEST_TOPIC: &str = "users";

pub fn test_user(id: i64) -> User {
    let mut user = User::new(id);
    user.email = Some(format!("user{id}@example.com"));
    user.nickname = Some(format!("user{id}"));
    user
}

/// A well-formed message carrying `test_user(id)`
pub fn raw_user(partition: i32, offset: i64, id: i64) -> RawMessage {
    RawMessage {
        partition: Partition::new(TEST_TOPIC, partition),
        offset,
        payload: Some(encode(&test_user(id)).unwrap()),
    }
}

/// `count` well-formed messages on one partition, ids equal to offsets
pub fn raw_users(partition: i32, count: i64) -> Vec<RawMessage> {
    (0..count)
        .map(|offset| raw_user(partition, offset, offset))
        .collect()
}

pub fn raw_garbage(partition: i32, offset: i64) -> RawMessage {
    RawMessage {
        partition: Partition::new(TEST_TOPIC, partition),
        offset,
        payload: Some(b"{\"id\": oops".to_vec()),
    }
}

pub fn user_record(partition: i32, offset: i64, id: i64) -> Record<User> {
    let payload = encode(&test_user(id)).unwrap();
    Record::new(
        SourcePosition::new(Partition::new(TEST_TOPIC, partition), offset),
        test_user(id),
        payload.len(),
    )
}

pub struct MemorySource {
    messages: VecDeque<RawMessage>,
    hold_open: bool,
    released: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages: messages.into(),
            hold_open: false,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stay pending after the last message instead of ending, like a live log
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.messages.len()
    }

    /// Set once the pipeline released the source
    pub fn released(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_message(&mut self) -> Option<Result<RawMessage, SourceError>> {
        match self.messages.pop_front() {
            Some(message) => Some(Ok(message)),
            None if self.hold_open => futures::future::pending().await,
            None => None,
        }
    }

    async fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Upserts records by key and remembers every successful write.
#[derive(Default)]
pub struct RecordingSink {
    flushes: Mutex<Vec<Vec<RecordKey>>>,
    stored: Mutex<HashMap<RecordKey, User>>,
    failures: Mutex<VecDeque<SinkError>>,
    always_fail: Mutex<Option<SinkError>>,
}

impl RecordingSink {
    /// The next `count` writes fail with `error`
    pub fn fail_next(&self, count: usize, error: SinkError) {
        let mut failures = self.failures.lock().unwrap();
        failures.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_always(&self, error: SinkError) {
        *self.always_fail.lock().unwrap() = Some(error);
    }

    pub fn flush_sizes(&self) -> Vec<usize> {
        self.flushes.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn flushed_keys(&self) -> Vec<RecordKey> {
        self.flushes.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn stored(&self) -> HashMap<RecordKey, User> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl BulkSink<User> for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn write_batch(&self, records: &[Record<User>]) -> Result<(), SinkError> {
        if let Some(error) = self.always_fail.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut stored = self.stored.lock().unwrap();
        for record in records {
            stored.insert(record.key().clone(), record.payload().clone());
        }
        self.flushes
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.key().clone()).collect());
        Ok(())
    }
}

/// Remembers every checkpoint; partitions can be marked as no longer owned.
#[derive(Default)]
pub struct MemoryCheckpointer {
    positions: Mutex<Vec<SourcePosition>>,
    not_claimed: Mutex<HashSet<Partition>>,
}

impl MemoryCheckpointer {
    pub fn reject(&self, partition: Partition) {
        self.not_claimed.lock().unwrap().insert(partition);
    }

    pub fn positions(&self) -> Vec<SourcePosition> {
        self.positions.lock().unwrap().clone()
    }

    /// Last checkpointed offset for a partition
    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.positions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.partition() == partition)
            .map(SourcePosition::offset)
            .last()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn checkpoint(&self, position: &SourcePosition) -> Result<(), CheckpointError> {
        if self.not_claimed.lock().unwrap().contains(position.partition()) {
            return Err(CheckpointError::NotClaimed(position.partition().clone()));
        }
        self.positions.lock().unwrap().push(position.clone());
        Ok(())
    }
}
