use rdkafka::ClientConfig;
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig};

/// Client settings shared by every batching consumer.
///
/// Offsets are never stored automatically: the pipeline stores an offset only
/// once the batch covering it has been flushed, and librdkafka's auto commit
/// then periodically commits whatever has been stored.
pub fn consumer_client_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &kafka.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer.kafka_consumer_group)
        .set("partition.assignment.strategy", "roundrobin")
        .set(
            "auto.offset.reset",
            consumer.kafka_consumer_offset_reset.as_str(),
        )
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            consumer.kafka_consumer_auto_commit_interval_ms.to_string(),
        )
        .set(
            "session.timeout.ms",
            consumer.kafka_consumer_session_timeout_ms.to_string(),
        );

    if kafka.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka consumer configuration: {:?}", client_config);
    client_config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffsetReset;

    fn configs(tls: bool, reset: OffsetReset) -> (KafkaConfig, ConsumerConfig) {
        (
            KafkaConfig {
                kafka_hosts: "kafka-1:9092,kafka-2:9092".to_string(),
                kafka_tls: tls,
                kafka_producer_linger_ms: 20,
                kafka_producer_queue_mib: 400,
                kafka_producer_queue_messages: 1000,
                kafka_message_timeout_ms: 20000,
                kafka_producer_retries: 10,
                kafka_compression_codec: "none".to_string(),
            },
            ConsumerConfig {
                kafka_consumer_group: "users-indexer".to_string(),
                kafka_consumer_topic: "users".to_string(),
                kafka_consumer_offset_reset: reset,
                kafka_consumer_auto_commit_interval_ms: 1000,
                kafka_consumer_session_timeout_ms: 30000,
            },
        )
    }

    #[test]
    fn offsets_are_stored_manually() {
        let (kafka, consumer) = configs(false, OffsetReset::Earliest);
        let config = consumer_client_config(&kafka, &consumer);

        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("group.id"), Some("users-indexer"));
        assert_eq!(
            config.get("bootstrap.servers"),
            Some("kafka-1:9092,kafka-2:9092")
        );
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn tls_and_latest() {
        let (kafka, consumer) = configs(true, OffsetReset::Latest);
        let config = consumer_client_config(&kafka, &consumer);

        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }
}
