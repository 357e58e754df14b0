use std::future::ready;

use axum::http::StatusCode;
use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use health::HealthRegistry;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::shutdown::{ShutdownCoordinator, ShutdownState};

/// Probe routes for a consumer process. Readiness flips to 503 as soon as the
/// pipeline starts draining, liveness follows the health registry.
pub fn router(
    service: &'static str,
    liveness: HealthRegistry,
    shutdown: ShutdownCoordinator,
) -> Router {
    Router::new()
        .route("/", get(move || ready(service)))
        .route(
            "/_readiness",
            get(move || {
                let status = match shutdown.is_running() {
                    true => StatusCode::OK,
                    false => StatusCode::SERVICE_UNAVAILABLE,
                };
                ready((status, shutdown.state().to_string()))
            }),
        )
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

/// Serves `router` plus `/metrics` on `bind` until the pipeline has stopped.
pub fn start_server(
    router: Router,
    bind: String,
    shutdown: ShutdownCoordinator,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let router = match setup_metrics_routes(router) {
            Ok(router) => router,
            Err(e) => {
                error!("failed to install metrics recorder: {}", e);
                return;
            }
        };

        info!(bind = %bind, "serving probes and metrics");
        let stopped = async move { shutdown.wait_for(ShutdownState::Stopped).await };
        if let Err(e) = serve(router, &bind, stopped).await {
            error!(bind = %bind, "probe server failed: {}", e);
        }
    })
}
