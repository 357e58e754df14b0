use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use user_pipeline::config::PipelineConfig;

/// Upper bound on rows per insert, whatever BATCH_SIZE asks for
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,

    #[envconfig(nested = true)]
    pub clickhouse: ClickHouseConfig,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults("user-inserter", "users");
        let mut config = Self::init_from_env()?;
        config.clamp_batch_size();
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn clamp_batch_size(&mut self) {
        self.pipeline.batch_size = self.pipeline.batch_size.min(MAX_BATCH_SIZE);
    }
}

#[derive(Envconfig, Clone)]
pub struct ClickHouseConfig {
    #[envconfig(from = "CLICKHOUSE_URL", default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(from = "CLICKHOUSE_DATABASE", default = "default")]
    pub clickhouse_database: String,

    #[envconfig(from = "CLICKHOUSE_USER", default = "default")]
    pub clickhouse_user: String,

    #[envconfig(from = "CLICKHOUSE_PASSWORD", default = "")]
    pub clickhouse_password: String,

    #[envconfig(from = "CLICKHOUSE_TABLE", default = "users")]
    pub clickhouse_table: String,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(batch_size: &str) -> Config {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "user-inserter".to_string()),
            ("KAFKA_CONSUMER_TOPIC".to_string(), "users".to_string()),
            ("BATCH_SIZE".to_string(), batch_size.to_string()),
        ]);
        let mut config = Config::init_from_hashmap(&env).unwrap();
        config.clamp_batch_size();
        config
    }

    #[test]
    fn batch_size_is_capped() {
        assert_eq!(config_with("5000").pipeline.batch_size, 100);
        assert_eq!(config_with("100").pipeline.batch_size, 100);
        assert_eq!(config_with("25").pipeline.batch_size, 25);
    }

    #[test]
    fn clickhouse_defaults() {
        let config = config_with("100");
        assert_eq!(config.clickhouse.clickhouse_url, "http://localhost:8123");
        assert_eq!(config.clickhouse.clickhouse_database, "default");
        assert_eq!(config.clickhouse.clickhouse_table, "users");
        assert_eq!(config.bind_address(), ":::3311");
    }
}
