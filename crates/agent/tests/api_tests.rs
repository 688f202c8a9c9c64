//! Integration tests for the agent API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fleet_agent_lib::{
    health::components,
    hypervisor::{async_trait, DryRunHypervisor, StaticDeviceSource},
    observability::AgentMetrics,
    reconciler::ReconcileResult,
    sync::{AgentConfigResponse, ControlPlane, EventListenerConfig, StatusReport, StatusResponse},
    Agent, AgentSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use api::AppState;

struct OfflineControlPlane;

#[async_trait]
impl ControlPlane for OfflineControlPlane {
    async fn fetch_config(&self, _agent_id: &str) -> Result<AgentConfigResponse> {
        anyhow::bail!("offline")
    }

    async fn push_status(&self, _agent_id: &str, _report: &StatusReport) -> Result<StatusResponse> {
        anyhow::bail!("offline")
    }
}

fn test_agent() -> Arc<Agent> {
    let settings = AgentSettings::new("agent-1")
        .with_node_name("node-1")
        .with_backend("dry-run")
        .with_events(EventListenerConfig {
            endpoint: "http://127.0.0.1:9/events".to_string(),
            min_backoff: Duration::from_secs(30),
            ..EventListenerConfig::default()
        });
    let hypervisor = Arc::new(DryRunHypervisor::new(Arc::new(StaticDeviceSource::default())));
    Arc::new(Agent::new(settings, hypervisor, Arc::new(OfflineControlPlane)).unwrap())
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let agent = test_agent();
    let health_registry = agent.health();
    health_registry.register_all().await;

    let state = Arc::new(AppState::new(health_registry, AgentMetrics::new(), agent));
    let router = api::create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::EVENT_LISTENER, "event stream disconnected")
        .await;

    // Degraded still returns 200 (operational)
    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::HYPERVISOR, "driver not loaded")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_started() {
    let (app, state) = setup_test_app().await;

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);

    state.agent.start().await.unwrap();
    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    state.agent.stop().await.unwrap();
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::RECONCILER, "Failed")
        .await;

    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.record_reconcile(
        &ReconcileResult {
            added: 1,
            ..ReconcileResult::default()
        },
        0.002,
    );
    state.metrics.set_config_version(7);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("fleet_agent_reconcile_duration_seconds_bucket"));
    assert!(metrics_text.contains("fleet_agent_workers_started_total"));
    assert!(metrics_text.contains("fleet_agent_config_version"));
}

#[tokio::test]
async fn test_status_reports_reconciler_state() {
    let (app, state) = setup_test_app().await;

    let (status, body) = get(app.clone(), "/status").await;
    assert_eq!(status, StatusCode::OK);
    let before: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(before["agent_id"], "agent-1");
    assert_eq!(before["running"], false);
    assert_eq!(before["reconciler"]["in_sync"], false);
    assert!(before["config_version"].is_null());

    state.agent.start().await.unwrap();
    let (_, body) = get(app, "/status").await;
    let after: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(after["running"], true);
    assert_eq!(after["reconciler"]["desired_count"], 0);
    assert_eq!(after["reconciler"]["in_sync"], true);

    state.agent.stop().await.unwrap();
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_, body) = get(app, "/healthz").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(health["components"].is_object());
    for name in components::ALL {
        assert!(health["components"][*name].is_object(), "missing {}", name);
    }
}
