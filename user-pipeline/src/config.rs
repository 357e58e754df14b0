use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::batch::BatchLimits;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct PipelineConfig {
    #[envconfig(default = "100")]
    pub batch_size: usize, // Records per flush

    pub batch_max_bytes: Option<usize>, // Optional bound on the serialized size of a batch

    #[envconfig(default = "1024")]
    pub queue_capacity: usize, // Per-partition queue between the reader and a worker

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration, // Time allowed for draining before giving up

    #[envconfig(nested = true)]
    pub flush_retry: FlushRetryConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct FlushRetryConfig {
    // 0 makes the first flush error fatal
    #[envconfig(default = "0")]
    pub flush_max_retries: u32,

    #[envconfig(default = "2")]
    pub flush_backoff_coefficient: u32,

    #[envconfig(default = "500")]
    pub flush_backoff_initial_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub flush_backoff_max_ms: EnvMsDuration,
}

impl PipelineConfig {
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits::new(self.batch_size).with_max_bytes(self.batch_max_bytes)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.flush_retry;
        RetryPolicy::build(retry.flush_backoff_coefficient, retry.flush_backoff_initial_ms.0)
            .max_retries(retry.flush_max_retries)
            .maximum_interval(retry.flush_backoff_max_ms.0)
            .provide()
    }

    /// Defaults for embedding the pipeline without environment configuration.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            batch_max_bytes: None,
            queue_capacity: 1024,
            shutdown_timeout_ms: EnvMsDuration(time::Duration::from_secs(30)),
            flush_retry: FlushRetryConfig {
                flush_max_retries: 0,
                flush_backoff_coefficient: 2,
                flush_backoff_initial_ms: EnvMsDuration(time::Duration::from_millis(500)),
                flush_backoff_max_ms: EnvMsDuration(time::Duration::from_secs(30)),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
