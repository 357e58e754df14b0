use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use user_pipeline::config::{EnvMsDuration, PipelineConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,

    #[envconfig(nested = true)]
    pub elasticsearch: ElasticConfig,
}

impl Config {
    /// Loads the environment, defaulting the consumer group and topic for this service.
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults("user-indexer", "users");
        Self::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct ElasticConfig {
    #[envconfig(default = "http://localhost:9200")]
    pub elasticsearch_hosts: String, // Comma separated base URLs, used round-robin

    pub elasticsearch_user: Option<String>,
    pub elasticsearch_password: Option<String>,

    #[envconfig(default = "users")]
    pub elasticsearch_index: String,

    #[envconfig(default = "10000")]
    pub elasticsearch_timeout_ms: EnvMsDuration,

    #[envconfig(default = "false")]
    pub elasticsearch_accept_invalid_certs: bool,
}

impl ElasticConfig {
    pub fn hosts(&self) -> Vec<&str> {
        self.elasticsearch_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_only_need_a_consumer_group_and_topic() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_CONSUMER_GROUP", "user-indexer"),
            ("KAFKA_CONSUMER_TOPIC", "users"),
        ]))
        .unwrap();

        assert_eq!(config.bind_address(), ":::3310");
        assert_eq!(config.elasticsearch.hosts(), vec!["http://localhost:9200"]);
        assert_eq!(config.elasticsearch.elasticsearch_index, "users");
        assert_eq!(config.elasticsearch.elasticsearch_user, None);
        assert_eq!(
            config.elasticsearch.elasticsearch_timeout_ms.0,
            Duration::from_secs(10)
        );
        assert_eq!(config.pipeline.batch_size, 100);
    }

    #[test]
    fn splits_and_trims_hosts() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_CONSUMER_GROUP", "user-indexer"),
            ("KAFKA_CONSUMER_TOPIC", "users"),
            ("ELASTICSEARCH_HOSTS", "http://es-1:9200, http://es-2:9200,,"),
            ("ELASTICSEARCH_USER", "elastic"),
            ("ELASTICSEARCH_PASSWORD", "changeme"),
        ]))
        .unwrap();

        assert_eq!(
            config.elasticsearch.hosts(),
            vec!["http://es-1:9200", "http://es-2:9200"]
        );
        assert_eq!(
            config.elasticsearch.elasticsearch_user.as_deref(),
            Some("elastic")
        );
    }
}
