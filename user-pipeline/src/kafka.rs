use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::kafka_consumer::consumer_client_config;
use health::HealthHandle;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpointer;
use crate::claims::ClaimRegistry;
use crate::error::{CheckpointError, SourceError};
use crate::source::{MessageSource, RawMessage};
use crate::types::{Partition, SourcePosition};

/// Drives the claim registry from the consumer's rebalance callbacks and
/// reports liveness from librdkafka's statistics callback.
pub struct ClaimContext<T> {
    registry: Arc<ClaimRegistry<T>>,
    liveness: Option<HealthHandle>,
}

impl<T> ClaimContext<T> {
    pub fn new(registry: Arc<ClaimRegistry<T>>, liveness: Option<HealthHandle>) -> Self {
        Self { registry, liveness }
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

impl<T: Send + 'static> ClientContext for ClaimContext<T> {
    fn stats(&self, _: Statistics) {
        // Stats only arrive while the client's poll loop is alive
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}

impl<T: Send + 'static> ConsumerContext for ClaimContext<T> {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("skipping empty revoke");
                    return;
                }
                let revoked = self.registry.revoke(&partitions_of(partitions));
                info!(
                    "revoked {} of {} partitions, their workers drain and flush",
                    revoked,
                    partitions.count()
                );
            }
            Rebalance::Assign(partitions) => {
                info!(
                    "pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("skipping empty assign");
                    return;
                }
                let generation = self.registry.setup(&partitions_of(partitions));
                info!(generation, "assigned {} partitions", partitions.count());
            }
            Rebalance::Revoke(_) => {
                debug!("post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("committed offsets for {} partitions", offsets.count()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("no new offsets to commit")
            }
            Err(e) => warn!("failed to commit offsets: {}", e),
        }
    }
}

/// Subscribes a consumer group member to one topic and hands out raw messages.
pub struct KafkaSource<T: Send + 'static> {
    consumer: Arc<StreamConsumer<ClaimContext<T>>>,
    topic: String,
}

impl<T: Send + 'static> KafkaSource<T> {
    /// Connects and subscribes, failing fast when the brokers can't be reached.
    pub fn new(
        kafka: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        context: ClaimContext<T>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer<ClaimContext<T>> =
            consumer_client_config(kafka, consumer_config).create_with_context(context)?;

        let topic = consumer_config.kafka_consumer_topic.clone();
        consumer
            .client()
            .fetch_metadata(Some(topic.as_str()), Duration::from_secs(10))?;
        consumer.subscribe(&[topic.as_str()])?;
        info!(
            topic = %topic,
            group = %consumer_config.kafka_consumer_group,
            "subscribed to topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
        })
    }

    pub fn checkpointer(&self) -> KafkaCheckpointer<T> {
        KafkaCheckpointer {
            consumer: self.consumer.clone(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSource for KafkaSource<T> {
    async fn next_message(&mut self) -> Option<Result<RawMessage, SourceError>> {
        let next = match self.consumer.recv().await {
            Ok(message) => Ok(RawMessage {
                partition: Partition::new(message.topic(), message.partition()),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec),
            }),
            Err(e) => Err(SourceError::Kafka(e)),
        };
        Some(next)
    }

    async fn release(&mut self) {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => info!(topic = %self.topic, "committed final offsets"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                info!(topic = %self.topic, "no offsets left to commit")
            }
            Err(e) => warn!(topic = %self.topic, "failed to commit final offsets: {}", e),
        }
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "left consumer group");
    }
}

/// Stores offsets for the next auto commit. Kafka commits the offset to resume
/// from, so a handled position is stored as `offset + 1`.
pub struct KafkaCheckpointer<T: Send + 'static> {
    consumer: Arc<StreamConsumer<ClaimContext<T>>>,
}

impl<T: Send + 'static> Checkpointer for KafkaCheckpointer<T> {
    fn checkpoint(&self, position: &SourcePosition) -> Result<(), CheckpointError> {
        self.consumer.store_offset(
            position.topic(),
            position.partition_number(),
            position.offset() + 1,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn partitions_of_lists_every_element() {
        let mut list = TopicPartitionList::new();
        list.add_partition("users", 0);
        list.add_partition_offset("users", 3, Offset::Offset(12))
            .unwrap();

        assert_eq!(
            partitions_of(&list),
            vec![Partition::new("users", 0), Partition::new("users", 3)]
        );
        assert!(partitions_of(&TopicPartitionList::new()).is_empty());
    }
}
