//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use fleetpipe_core::health::{ComponentStatus, HealthCheck, HealthStatus};
use fleetpipe_core::metrics::PipelineMetrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<PipelineMetrics>,
}

/// Health response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentStatusResponse>,
}

/// Component status response.
#[derive(Debug, Serialize)]
pub struct ComponentStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentStatusResponse {
    fn from(status: &ComponentStatus) -> Self {
        let (status, message) = match status {
            ComponentStatus::Healthy => ("healthy", None),
            ComponentStatus::Degraded(msg) => ("degraded", Some(msg.clone())),
            ComponentStatus::Unhealthy(msg) => ("unhealthy", Some(msg.clone())),
            ComponentStatus::Unknown => ("unknown", None),
        };
        ComponentStatusResponse {
            status: status.to_string(),
            message,
        }
    }
}

fn router(state: Arc<ServerState>) -> (Router, Router) {
    let health = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(Arc::clone(&state));

    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    (health, metrics)
}

/// Start the HTTP servers for health and metrics.
pub async fn start_server(
    state: Arc<ServerState>,
    health_port: u16,
    metrics_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (health_router, metrics_router) = router(state);

    let health_addr = SocketAddr::from(([0, 0, 0, 0], health_port));
    let health_listener = match tokio::net::TcpListener::bind(health_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = health_port, "Failed to bind health server");
            return;
        }
    };
    info!(port = health_port, "Health server started");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let metrics_listener = match tokio::net::TcpListener::bind(metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = metrics_port, "Failed to bind metrics server");
            return;
        }
    };
    info!(port = metrics_port, "Metrics server started");

    let health_server = async {
        axum::serve(health_listener, health_router)
            .await
            .map_err(|e| error!(error = %e, "Health server error"))
    };

    let metrics_server = async {
        axum::serve(metrics_listener, metrics_router)
            .await
            .map_err(|e| error!(error = %e, "Metrics server error"))
    };

    tokio::select! {
        _ = health_server => {}
        _ = metrics_server => {}
        _ = shutdown_rx.recv() => {
            info!("HTTP servers shutting down");
        }
    }
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let overall = state.health.overall_status();

    let components = state
        .health
        .get_all_statuses()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), ComponentStatusResponse::from(v)))
        .collect();

    let (status, status_code) = match overall {
        HealthStatus::Healthy => ("healthy", StatusCode::OK),
        HealthStatus::Degraded => ("degraded", StatusCode::OK),
        HealthStatus::Unhealthy => ("unhealthy", StatusCode::SERVICE_UNAVAILABLE),
    };

    let response = HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.health.uptime().as_secs(),
        components,
    };

    (status_code, Json(response))
}

/// Liveness handler.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.overall_status() != HealthStatus::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness handler: the main loop runs and nothing is unhealthy.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.is_job_running() && state.health.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus_text(),
    )
}
