//! Metrics and probe endpoints.
//!
//! - `/metrics`: Prometheus text exposition
//! - `/healthz`: liveness, always 200 while the process serves requests
//! - `/readyz`: 200 once the provider API has been synchronized, 503 before

use crate::error::ControllerError;
use crate::metrics::PrometheusMetrics;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ipam::NodeManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// State shared by the HTTP handlers
#[derive(Debug, Clone)]
pub struct AppState {
    metrics: Arc<PrometheusMetrics>,
    manager: Arc<NodeManager>,
}

impl AppState {
    /// Creates the handler state
    pub fn new(metrics: Arc<PrometheusMetrics>, manager: Arc<NodeManager>) -> Self {
        Self { metrics, manager }
    }
}

/// Routes of the metrics/probes server
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Serves [`router`] on `addr` until the task is dropped
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "Serving metrics and probes");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Server(e.to_string()))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.manager.instances_api_is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
