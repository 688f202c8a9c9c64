//! Operator endpoints: liveness, readiness, Prometheus scrape and a status dump

use fleet_agent_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::AgentMetrics,
    Agent,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

/// Everything the handlers need, shared behind one `Arc`
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub agent: Arc<Agent>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: AgentMetrics, agent: Arc<Agent>) -> Self {
        Self {
            health_registry,
            metrics,
            agent,
        }
    }
}

/// Liveness. A degraded component (e.g. a dropped event stream) still
/// answers 200; only an unhealthy one fails the check.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(health))
}

/// 200 once `Agent::start` has finished and nothing is unhealthy
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let code = match readiness.ready {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(readiness))
}

/// Text exposition of the process-global registry
async fn metrics() -> Response {
    let mut body = Vec::new();
    match TextEncoder::new().encode(&prometheus::gather(), &mut body) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Cannot encode Prometheus scrape");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Desired/actual counts, config version, license and event-stream state
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.agent.status().await)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind on all interfaces and serve until the task is aborted
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Cannot bind operator API on port {}", port))?;
    info!(port = port, "Serving operator API");

    axum::serve(listener, create_router(state))
        .await
        .context("Operator API server failed")
}
