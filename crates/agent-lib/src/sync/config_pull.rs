//! Config pull pipeline
//!
//! Fetches the desired worker list and license, converts remote workers into
//! hypervisor-facing specs and hands them to the reconciler. Pulls run on a
//! timer and whenever a [`PullTrigger`] fires.

use super::cache::ConfigCache;
use super::client::{AgentConfigResponse, ControlPlane, RemoteWorker};
use crate::health::{components, HealthRegistry};
use crate::hypervisor::Hypervisor;
use crate::models::{Device, GpuVendor, IsolationMode, LaunchCommand, ResourceLimits, WorkerSpec};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::reconciler::Reconciler;
use crate::ticker::periodic;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory workers write their connection files to
pub const CONNECTIONS_DIR_ENV: &str = "FLEET_CONNECTIONS_DIR";
pub const WORKER_ID_ENV: &str = "FLEET_WORKER_ID";
pub const COMPUTE_LIMIT_ENV: &str = "FLEET_GPU_COMPUTE_LIMIT_PERCENT";
pub const MEMORY_LIMIT_ENV: &str = "FLEET_GPU_MEMORY_LIMIT_MB";

const NVIDIA_VISIBILITY_ENV: &str = "CUDA_VISIBLE_DEVICES";
const AMD_VISIBILITY_ENVS: &[&str] = &["HIP_VISIBLE_DEVICES", "ROCR_VISIBLE_DEVICES"];

/// Coalescing request for an out-of-band config pull
#[derive(Debug, Clone)]
pub struct PullTrigger {
    tx: mpsc::Sender<()>,
}

impl PullTrigger {
    /// Capacity-1 channel: a pending request absorbs later ones
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns false when a pull was already pending
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Host-side launch settings shared by every worker
#[derive(Debug, Clone, Default)]
pub struct LaunchTemplate {
    pub executable: PathBuf,
    pub base_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub connections_dir: Option<PathBuf>,
}

/// Visibility variables for the worker's GPUs.
///
/// Known devices are addressed by index, unknown ones by raw id. AMD devices
/// get both ROCm variables; everything else gets the CUDA one.
pub fn visibility_env(gpu_ids: &[String], devices: &[Device]) -> HashMap<String, String> {
    if gpu_ids.is_empty() {
        return HashMap::new();
    }

    let known: HashMap<&str, &Device> = devices.iter().map(|d| (d.gpu_id.as_str(), d)).collect();
    let vendor = gpu_ids
        .iter()
        .find_map(|id| known.get(id.as_str()).map(|d| d.vendor))
        .unwrap_or(GpuVendor::Nvidia);
    let value = gpu_ids
        .iter()
        .map(|id| match known.get(id.as_str()) {
            Some(device) => device.index.to_string(),
            None => id.clone(),
        })
        .collect::<Vec<_>>()
        .join(",");

    let names: &[&str] = match vendor {
        GpuVendor::Amd => AMD_VISIBILITY_ENVS,
        _ => &[NVIDIA_VISIBILITY_ENV],
    };
    names
        .iter()
        .map(|name| (name.to_string(), value.clone()))
        .collect()
}

/// Hard-limit variables, exported only for partitioned isolation
pub fn limit_env(isolation: IsolationMode, limits: &ResourceLimits) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if !isolation.enforces_limits() {
        return env;
    }
    if limits.compute_percent > 0 {
        env.insert(
            COMPUTE_LIMIT_ENV.to_string(),
            limits.compute_percent.to_string(),
        );
    }
    if limits.vram_mb > 0 {
        env.insert(MEMORY_LIMIT_ENV.to_string(), limits.vram_mb.to_string());
    }
    env
}

/// Convert a control-plane worker into the `WorkerSpec` the reconciler converges on
pub fn to_worker_spec(remote: &RemoteWorker, template: &LaunchTemplate, devices: &[Device]) -> WorkerSpec {
    let isolation = IsolationMode::parse(&remote.isolation);
    let limits = ResourceLimits {
        vram_mb: remote.vram_mb,
        compute_percent: remote.compute_percent,
    };

    let mut args = template.base_args.clone();
    if let Some(port) = remote.listen_port {
        args.push("--port".to_string());
        args.push(port.to_string());
    }
    args.extend(remote.args.iter().cloned());

    // Agent-owned variables override anything the control plane sent
    let mut env = remote.env.clone();
    env.extend(visibility_env(&remote.gpu_ids, devices));
    env.extend(limit_env(isolation, &limits));
    env.insert(WORKER_ID_ENV.to_string(), remote.worker_id.clone());
    if let Some(dir) = &template.connections_dir {
        env.insert(
            CONNECTIONS_DIR_ENV.to_string(),
            dir.to_string_lossy().into_owned(),
        );
    }

    WorkerSpec {
        worker_id: remote.worker_id.clone(),
        gpu_ids: remote.gpu_ids.clone(),
        enabled: remote.enabled,
        limits,
        isolation,
        command: LaunchCommand {
            executable: template.executable.clone(),
            args,
            working_dir: template.working_dir.clone(),
            env,
        },
    }
}

/// Result of one pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Applied { version: u64, workers: usize },
    /// Remote version not newer than the cached one
    Unchanged { version: u64 },
}

/// Pulls config and feeds the reconciler
pub struct ConfigPuller {
    agent_id: String,
    control_plane: Arc<dyn ControlPlane>,
    hypervisor: Arc<dyn Hypervisor>,
    reconciler: Arc<Reconciler>,
    cache: Arc<ConfigCache>,
    template: LaunchTemplate,
    interval: Duration,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl ConfigPuller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        control_plane: Arc<dyn ControlPlane>,
        hypervisor: Arc<dyn Hypervisor>,
        reconciler: Arc<Reconciler>,
        cache: Arc<ConfigCache>,
        template: LaunchTemplate,
        interval: Duration,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            control_plane,
            hypervisor,
            reconciler,
            cache,
            template,
            interval,
            metrics: AgentMetrics::new(),
            logger,
            health: None,
        }
    }

    /// Report each loop iteration to the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn pull(&self) -> Result<PullOutcome> {
        let config = self
            .control_plane
            .fetch_config(&self.agent_id)
            .await
            .context("Config pull failed")?;
        self.apply(config).await
    }

    /// Apply a fetched config if its version is newer than the cached one
    pub async fn apply(&self, config: AgentConfigResponse) -> Result<PullOutcome> {
        if let Some(license) = &config.license {
            if self.cache.set_license(license.clone()).await {
                let expiry = license.expiration_ms();
                self.metrics.set_license_expiry(expiry);
                self.logger.log_license_updated(expiry);
            }
        }

        if !self.cache.is_newer(config.version).await {
            debug!(version = config.version, "Config unchanged");
            return Ok(PullOutcome::Unchanged {
                version: config.version,
            });
        }

        let devices = self.devices().await;
        let specs: Vec<WorkerSpec> = config
            .workers
            .iter()
            .map(|remote| to_worker_spec(remote, &self.template, &devices))
            .collect();
        let count = specs.len();

        let previous = self.cache.version().await;
        self.reconciler.set_desired_workers(specs).await;
        self.cache.apply(&config).await;

        self.metrics.set_config_version(config.version);
        self.logger
            .log_config_applied(previous, config.version, count);

        Ok(PullOutcome::Applied {
            version: config.version,
            workers: count,
        })
    }

    /// Live device list, falling back to the last cached one
    async fn devices(&self) -> Vec<Device> {
        match self.hypervisor.list_devices().await {
            Ok(devices) => {
                self.cache.set_gpus(devices.clone()).await;
                devices
            }
            Err(e) => {
                debug!(error = %e, "Using cached device list for spec conversion");
                self.cache.gpus().await
            }
        }
    }

    /// Pull on every tick and every trigger until cancelled
    pub async fn run(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        let mut ticker = periodic("config_pull", self.interval);
        // The agent performs the initial pull itself
        ticker.tick().await;

        info!(
            interval_secs = self.interval.as_secs(),
            "Config pull loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = trigger_rx.recv() => debug!("Triggered config pull"),
            }

            let result = self.pull().await;
            if let Err(e) = &result {
                warn!(error = %e, "Config pull failed; retrying next cycle");
            }
            if let Some(health) = &self.health {
                health.record(components::CONFIG_PULLER, &result).await;
            }
        }

        info!("Config pull loop stopped");
    }
}
