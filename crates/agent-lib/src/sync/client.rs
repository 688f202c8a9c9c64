//! REST client for the fleet control plane
//!
//! This module provides:
//! - Wire types for the config pull and status push endpoints
//! - A `ControlPlane` trait so pipelines can be driven by fakes in tests
//! - `HttpControlPlane`, the reqwest implementation with bearer-token auth

use crate::models::{ConnectionRecord, WorkerStatus};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Signed license blob as issued by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub signature: String,
    /// Pipe-delimited; the third field is the expiry in epoch milliseconds
    pub plain: String,
}

/// One worker as described by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorker {
    pub worker_id: String,
    #[serde(default)]
    pub gpu_ids: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub vram_mb: u64,
    #[serde(default)]
    pub compute_percent: u32,
    #[serde(default)]
    pub isolation: String,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// Response of `GET /agents/{id}/config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigResponse {
    pub version: u64,
    #[serde(default)]
    pub workers: Vec<RemoteWorker>,
    #[serde(default)]
    pub license: Option<License>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatusReport {
    pub gpu_id: String,
    pub vendor: String,
    pub model: String,
    pub vram_mb: u64,
    pub driver_version: String,
    pub runtime_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<u64>,
    /// False for a GPU that disappeared since the last report
    pub present: bool,
    pub gpu_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub gpu_ids: Vec<String>,
    pub connections: Vec<ConnectionRecord>,
    pub worker_changed: bool,
    pub connection_changed: bool,
    pub gpu_changed: bool,
}

/// Body of `POST /agents/{id}/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub gpus: Vec<GpuStatusReport>,
    pub workers: Vec<WorkerStatusReport>,
    pub license_expiration: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub config_version: u64,
    #[serde(default)]
    pub license: Option<License>,
}

/// Remote operations the agent pipelines depend on
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn fetch_config(&self, agent_id: &str) -> Result<AgentConfigResponse>;

    async fn push_status(&self, agent_id: &str, report: &StatusReport) -> Result<StatusResponse>;
}

/// Configuration for the HTTP control-plane client
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Base URL, e.g. "https://fleet.example.com/api/v1"
    pub endpoint: String,
    /// Bearer token obtained out of band
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/api/v1".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest-backed control-plane client
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    http: reqwest::Client,
    base: Url,
}

impl HttpControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Result<Self> {
        let base = parse_base_url(&config.endpoint)?;

        let mut headers = HeaderMap::new();
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("API token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `{base}/agents/{agent_id}/{action}`, with the id escaped as one segment
    fn agent_url(&self, agent_id: &str, action: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Endpoint URL cannot be a base: {}", self.base))?
            .pop_if_empty()
            .extend(["agents", agent_id, action]);
        Ok(url)
    }
}

/// Parse a base URL so that relative joins append to its path
pub(crate) fn parse_base_url(endpoint: &str) -> Result<Url> {
    let mut url =
        Url::parse(endpoint).with_context(|| format!("Invalid endpoint URL: {}", endpoint))?;
    if url.cannot_be_a_base() {
        return Err(anyhow!("Endpoint URL cannot be a base: {}", endpoint));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{} failed with HTTP {}: {}", what, status, body.trim());
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("Failed to decode {} response", what))
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_config(&self, agent_id: &str) -> Result<AgentConfigResponse> {
        let url = self.agent_url(agent_id, "config")?;
        debug!(url = %url, "Fetching agent config");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("Config pull request failed")?;
        read_json(response, "Config pull").await
    }

    async fn push_status(&self, agent_id: &str, report: &StatusReport) -> Result<StatusResponse> {
        let url = self.agent_url(agent_id, "status")?;
        debug!(
            url = %url,
            gpus = report.gpus.len(),
            workers = report.workers.len(),
            "Pushing status report"
        );
        let response = self
            .http
            .post(url)
            .json(report)
            .send()
            .await
            .context("Status push request failed")?;
        read_json(response, "Status push").await
    }
}
