use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::claims::ClaimRegistry;
use crate::error::{DecodeError, SourceError};
use crate::record::{Decode, Identified, Record};
use crate::stats::PipelineStats;
use crate::types::{Partition, SourcePosition};

/// A message as read from the log, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: Partition,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// What travels through a partition queue. Malformed messages are carried as
/// `Skipped` so their offsets are acknowledged in order with the records around them.
#[derive(Debug)]
pub enum Delivery<T> {
    Record(Record<T>),
    Skipped(SourcePosition),
}

impl<T> Delivery<T> {
    pub fn position(&self) -> &SourcePosition {
        match self {
            Delivery::Record(record) => record.position(),
            Delivery::Skipped(position) => position,
        }
    }
}

/// Pull side of a partitioned log.
#[async_trait]
pub trait MessageSource: Send {
    /// Next message from any claimed partition, None once the source is exhausted.
    async fn next_message(&mut self) -> Option<Result<RawMessage, SourceError>>;

    /// Called once every worker has finished, to commit what was checkpointed
    /// and leave the consumer group.
    async fn release(&mut self) {}
}

/// Reads raw messages, decodes them and routes each into its partition's queue.
/// Blocking on a full queue is what throttles the reader when a sink lags.
pub struct StreamReader<T> {
    registry: Arc<ClaimRegistry<T>>,
    stats: Arc<PipelineStats>,
}

impl<T> StreamReader<T>
where
    T: Decode + Identified + Send + 'static,
{
    pub fn new(registry: Arc<ClaimRegistry<T>>, stats: Arc<PipelineStats>) -> Self {
        Self { registry, stats }
    }

    /// Runs until the source is exhausted or `shutdown` fires, then closes every
    /// partition queue and gives the source back for release.
    pub async fn run<S: MessageSource>(self, mut source: S, shutdown: CancellationToken) -> S {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, stream reader stops pulling");
                    break;
                }
                next = source.next_message() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("failed to receive message: {}", e);
                    self.stats.receive_error();
                    continue;
                }
                None => {
                    info!("message source exhausted");
                    break;
                }
            };

            let sender = self.registry.sender_or_claim(&message.partition);
            let delivery = self.decode(message);
            let is_record = matches!(delivery, Delivery::Record(_));

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested while a partition queue was full");
                    break;
                }
                sent = sender.send(delivery) => {
                    if let Err(unsent) = sent {
                        // The claim was revoked after we looked it up; the next owner
                        // re-reads this message from the last committed offset
                        debug!(
                            position = %unsent.0.position(),
                            "partition queue closed, dropping message"
                        );
                        continue;
                    }
                }
            }

            if is_record {
                self.stats.record_received();
            }
        }

        self.registry.close_all();
        source
    }

    fn decode(&self, message: RawMessage) -> Delivery<T> {
        let position = SourcePosition::new(message.partition, message.offset);
        let decoded = match message.payload {
            Some(payload) => {
                T::decode(&payload).map(|value| Record::new(position.clone(), value, payload.len()))
            }
            None => Err(DecodeError::EmptyPayload),
        };

        match decoded {
            Ok(record) => Delivery::Record(record),
            Err(e) => {
                warn!(
                    topic = position.topic(),
                    partition = position.partition_number(),
                    offset = position.offset(),
                    "skipping undecodable message: {}",
                    e
                );
                self.stats.receive_error();
                Delivery::Skipped(position)
            }
        }
    }
}
