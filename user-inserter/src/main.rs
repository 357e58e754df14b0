use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use health::HealthRegistry;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use user_pipeline::kafka::{ClaimContext, KafkaSource};
use user_pipeline::shutdown::ShutdownCoordinator;
use user_pipeline::{probes, Pipeline, User};

use user_inserter::config::Config;
use user_inserter::store::ClickHouseSink;

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_with_defaults()
        .context("failed to load configuration from the environment")?;
    info!(
        batch_size = config.pipeline.batch_size,
        table = %config.clickhouse.clickhouse_table,
        "starting user inserter"
    );

    let liveness = HealthRegistry::new("liveness");
    let kafka_liveness = liveness.register("rdkafka", Duration::from_secs(30));

    let shutdown = ShutdownCoordinator::new();
    shutdown
        .install_signal_handlers()
        .context("failed to install signal handlers")?;

    let sink =
        ClickHouseSink::new(&config.clickhouse).context("invalid clickhouse configuration")?;
    sink.ensure_table()
        .await
        .with_context(|| format!("failed to create table {}", sink.table()))?;

    let server = probes::start_server(
        probes::router("user inserter", liveness, shutdown.clone()),
        config.bind_address(),
        shutdown.clone(),
    );

    let pipeline = Pipeline::<User>::new(
        config.pipeline.clone(),
        &config.consumer.kafka_consumer_topic,
        Arc::new(sink),
        shutdown.clone(),
    );
    let context = ClaimContext::new(pipeline.registry(), Some(kafka_liveness));
    let source = KafkaSource::new(&config.kafka, &config.consumer, context)
        .context("failed to subscribe to the users topic")?;
    let pipeline = pipeline.with_checkpointer(Arc::new(source.checkpointer()));

    let result = pipeline.run(source).await;
    server.abort();

    let stats = result.context("insert pipeline failed")?;
    info!(
        received = stats.received,
        receive_errors = stats.receive_errors,
        inserted = stats.flushed_records,
        batches = stats.flushed_batches,
        "user inserter stopped"
    );
    Ok(())
}
