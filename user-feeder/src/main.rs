use std::future::{pending, ready};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use common_kafka::kafka_producer::{create_kafka_producer, KafkaContext};
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use health::HealthRegistry;
use rdkafka::producer::FutureProducer;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use user_feeder::api::{self, ApiState};
use user_feeder::config::{Config, SourceKind};
use user_feeder::feed::{pump, FeedStats};
use user_feeder::metrics_consts::FEED_DURATION;
use user_feeder::{csv_source, db_source};
use user_pipeline::shutdown::{ShutdownCoordinator, ShutdownState};

fn start_server(config: &Config, liveness: HealthRegistry) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(|| ready("user feeder")))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let bind = config.bind_address();

    tokio::spawn(async move {
        let router = match setup_metrics_routes(router) {
            Ok(router) => router,
            Err(e) => {
                error!("failed to install metrics recorder: {}", e);
                return;
            }
        };
        if let Err(e) = serve(router, &bind, pending()).await {
            error!(bind = %bind, "metrics server failed: {}", e);
        }
    })
}

/// Accepts pushed users until SIGINT or SIGTERM, then stops taking requests.
async fn serve_api(
    config: &Config,
    producer: FutureProducer<KafkaContext>,
    liveness: HealthRegistry,
) -> Result<()> {
    let shutdown = ShutdownCoordinator::new();
    shutdown
        .install_signal_handlers()
        .context("failed to install signal handlers")?;

    let topic = config.kafka_producer_topic.clone();
    let stats = Arc::new(FeedStats::new(SourceKind::Api, &topic));
    let state = ApiState::new(Arc::new(producer), &topic, stats.clone());
    let router = setup_metrics_routes(api::router(state, liveness, shutdown.clone()))
        .context("failed to install metrics recorder")?;

    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(bind = %bind, topic = %topic, "accepting users over http");

    let draining = shutdown.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { draining.wait_for(ShutdownState::Draining).await })
    .await
    .context("http server failed")?;
    shutdown.mark_stopped();

    let totals = stats.totals();
    info!(
        topic = %topic,
        received = totals.read,
        receive_errors = totals.read_errors,
        sent = totals.sent,
        send_errors = totals.send_errors,
        "user feeder api stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env()
        .context("failed to load configuration from the environment")?;

    let liveness = HealthRegistry::new("liveness");
    let producer = create_kafka_producer(
        &config.kafka,
        liveness.register("rdkafka", Duration::from_secs(30)),
    )
    .await
    .context("failed to connect to kafka")?;

    if config.feeder_source == SourceKind::Api {
        return serve_api(&config, producer, liveness).await;
    }
    let server = start_server(&config, liveness);

    let topic = config.kafka_producer_topic.clone();
    let stats = Arc::new(FeedStats::new(config.feeder_source, &topic));
    let (tx, rx) = mpsc::channel(config.read_buffer.max(1));
    let started = Instant::now();

    let reader: JoinHandle<Result<()>> = match config.feeder_source {
        SourceKind::Csv => {
            let path = config.csv_path.clone();
            let stats = stats.clone();
            tokio::task::spawn_blocking(move || {
                csv_source::read_file(&path, &tx, &stats)
                    .with_context(|| format!("failed to read {path}"))
            })
        }
        SourceKind::Db => {
            let database_url = config
                .database_url
                .clone()
                .context("DATABASE_URL is required for the db source")?;
            let table = config.db_table.clone();
            let key_column = config.db_key_column.clone();
            let limit = config.db_row_limit;
            let stats = stats.clone();
            tokio::spawn(async move {
                let pool = db_source::connect(&database_url)
                    .await
                    .context("failed to connect to the database")?;
                db_source::read_users(&pool, &table, &key_column, limit, &tx, &stats)
                    .await
                    .with_context(|| format!("failed to read users from {table}"))
            })
        }
        SourceKind::Api => anyhow::bail!("the api source is served, not read"),
    };

    pump(&producer, &topic, rx, config.send_chunk_size, &stats).await;
    let read = reader.await.context("user reader panicked")?;

    let elapsed = started.elapsed();
    common_metrics::gauge(FEED_DURATION, &[], elapsed.as_secs_f64());
    let totals = stats.totals();
    info!(
        source = %config.feeder_source,
        topic = %topic,
        read = totals.read,
        read_errors = totals.read_errors,
        sent = totals.sent,
        send_errors = totals.send_errors,
        elapsed_ms = elapsed.as_millis() as u64,
        "feed finished"
    );

    server.abort();
    read
}
