use std::time::Duration;

use futures::future::join_all;
use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // The librdkafka main loop is alive if it calls us
        self.liveness.report_healthy();
    }
}

pub fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("retries", config.kafka_producer_retries.to_string())
        .set("compression.codec", config.kafka_compression_codec.as_str())
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let client_config = producer_client_config(config);
    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // "Ping" the brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] SerdeError),
    #[error("failed to produce message: {0}")]
    Kafka(#[from] KafkaError),
    #[error("delivery canceled before an ack arrived")]
    Canceled,
}

/// Outcome of one produced batch.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Index in the input slice and why that item was not delivered, in input order
    pub failed: Vec<(usize, ProduceError)>,
}

/// Enqueues every item as a JSON message keyed by `key_of`, then waits for all
/// delivery acks at once.
pub async fn produce_json_batch<T, C>(
    producer: &FutureProducer<C>,
    topic: &str,
    items: &[T],
    key_of: impl Fn(&T) -> String,
) -> DeliveryReport
where
    T: Serialize,
    C: ClientContext + 'static,
{
    let mut report = DeliveryReport::default();
    let mut pending = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let payload = match serde_json::to_vec(item) {
            Ok(payload) => payload,
            Err(e) => {
                report.failed.push((index, e.into()));
                continue;
            }
        };
        let key = key_of(item);
        let record = FutureRecord::to(topic)
            .key(key.as_str())
            .payload(payload.as_slice());

        match producer.send_result(record) {
            Ok(delivery) => pending.push(async move { (index, delivery.await) }),
            Err((e, _)) => report.failed.push((index, e.into())),
        }
    }

    for (index, ack) in join_all(pending).await {
        match ack {
            Ok(Ok(_)) => report.delivered += 1,
            Ok(Err((e, _))) => report.failed.push((index, e.into())),
            Err(_) => report.failed.push((index, ProduceError::Canceled)),
        }
    }
    report.failed.sort_by_key(|(index, _)| *index);
    report
}
