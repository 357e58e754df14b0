//! HTTP push source: clients POST a JSON array of users, which is produced to
//! the topic before the request is answered.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_client_ip::InsecureClientIp;
use common_kafka::kafka_producer::KafkaContext;
use health::HealthRegistry;
use rdkafka::producer::FutureProducer;
use serde_json::{json, Value};
use tracing::warn;
use user_pipeline::probes;
use user_pipeline::shutdown::ShutdownCoordinator;
use user_pipeline::User;

use crate::feed::{send_users, FeedStats};
use crate::metrics_consts::{API_RECEIVED, API_RECEIVE_ERRORS};

#[derive(Clone)]
pub struct ApiState {
    producer: Arc<FutureProducer<KafkaContext>>,
    topic: Arc<str>,
    stats: Arc<FeedStats>,
}

impl ApiState {
    pub fn new(
        producer: Arc<FutureProducer<KafkaContext>>,
        topic: &str,
        stats: Arc<FeedStats>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            stats,
        }
    }
}

pub fn router(state: ApiState, liveness: HealthRegistry, shutdown: ShutdownCoordinator) -> Router {
    Router::new()
        .route("/users", post(receive_users))
        .with_state(state)
        .route("/version", get(version))
        .merge(probes::router("user feeder api", liveness, shutdown))
}

async fn receive_users(
    State(state): State<ApiState>,
    InsecureClientIp(ip): InsecureClientIp,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let labels = [("source_ip".to_string(), ip.to_string())];

    let users: Vec<User> = match serde_json::from_slice(&body) {
        Ok(users) => users,
        Err(e) => {
            warn!(source_ip = %ip, "rejecting users payload: {}", e);
            state.stats.read_error();
            common_metrics::inc(API_RECEIVE_ERRORS, &labels, 1);
            return Err((StatusCode::BAD_REQUEST, e.to_string()));
        }
    };

    for _ in &users {
        state.stats.user_read();
    }
    common_metrics::inc(API_RECEIVED, &labels, users.len() as u64);

    let failed = send_users(&state.producer, &state.topic, &users, &state.stats).await;
    if failed > 0 {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to send {} of {} users", failed, users.len()),
        ));
    }
    Ok(StatusCode::OK)
}

async fn version() -> Json<Value> {
    Json(json!({
        "appName": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
