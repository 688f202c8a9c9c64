//! Change-detection and status reporting
//!
//! This module provides:
//! - Snapshots of GPU, worker and connection state between report cycles
//! - Per-entity change flags, with a periodic force refresh bounding staleness
//! - The status loop that pushes reports and reacts to the response

mod connections;
mod snapshot;

#[cfg(test)]
mod tests;

pub use connections::{parse_connection_line, parse_connections, ConnectionReader};
pub use snapshot::{GpuSnapshot, SnapshotStore, SnapshotSummary, WorkerSnapshot};

use crate::health::{components, HealthRegistry};
use crate::hypervisor::Hypervisor;
use crate::models::{ConnectionSet, Device, DeviceMetrics, WorkerActual, WorkerSpec, WorkerStatus};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::reconciler::Reconciler;
use crate::ticker::periodic;
use crate::sync::{ConfigCache, ControlPlane, GpuStatusReport, PullTrigger, StatusReport, WorkerStatusReport};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the status loop
#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub interval: Duration,
    /// Upper bound between full reports
    pub force_refresh_interval: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            force_refresh_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// One worker as observed this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedWorker {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub gpu_ids: Vec<String>,
}

impl ObservedWorker {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot::new(self.status, self.pid, self.restart_count, &self.gpu_ids)
    }
}

/// Derive upstream statuses from the facade's view and the desired set.
///
/// Running workers that are no longer wanted are `stopping`; enabled desired
/// workers the facade does not know yet are `pending`.
pub fn derive_worker_statuses(desired: &[WorkerSpec], actual: &[WorkerActual]) -> Vec<ObservedWorker> {
    let wanted: HashMap<&str, bool> = desired
        .iter()
        .map(|s| (s.worker_id.as_str(), s.enabled))
        .collect();
    let present: HashSet<&str> = actual.iter().map(|w| w.worker_id.as_str()).collect();

    let mut observed: Vec<ObservedWorker> = actual
        .iter()
        .map(|w| {
            let status = match (w.running, wanted.get(w.worker_id.as_str())) {
                (true, Some(true)) => WorkerStatus::Running,
                (true, _) => WorkerStatus::Stopping,
                (false, _) => WorkerStatus::Stopped,
            };
            ObservedWorker {
                worker_id: w.worker_id.clone(),
                status,
                pid: w.pid,
                restart_count: w.restart_count,
                gpu_ids: w.gpu_ids.clone(),
            }
        })
        .collect();

    observed.extend(
        desired
            .iter()
            .filter(|s| s.enabled && !present.contains(s.worker_id.as_str()))
            .map(|s| ObservedWorker {
                worker_id: s.worker_id.clone(),
                status: WorkerStatus::Pending,
                pid: None,
                restart_count: 0,
                gpu_ids: s.gpu_ids.clone(),
            }),
    );

    observed.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    observed
}

/// Everything one cycle reads before taking the snapshot lock
struct Observation {
    devices: Vec<Device>,
    metrics: HashMap<String, DeviceMetrics>,
    workers: Vec<ObservedWorker>,
    connections: HashMap<String, ConnectionSet>,
    /// Facade unavailable; workers come from the cached config
    fallback: bool,
}

/// Outcome of a cycle, whether or not the send succeeded
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub report: StatusReport,
    pub forced: bool,
    pub fallback: bool,
}

impl CycleReport {
    pub fn changed_workers(&self) -> usize {
        self.report
            .workers
            .iter()
            .filter(|w| w.worker_changed || w.connection_changed || w.gpu_changed)
            .count()
    }
}

/// Builds and pushes status reports
pub struct StatusReporter {
    agent_id: String,
    config: StatusConfig,
    hypervisor: Arc<dyn Hypervisor>,
    control_plane: Arc<dyn ControlPlane>,
    reconciler: Arc<Reconciler>,
    cache: Arc<ConfigCache>,
    connections: ConnectionReader,
    snapshots: RwLock<SnapshotStore>,
    pull_trigger: PullTrigger,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl StatusReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        config: StatusConfig,
        hypervisor: Arc<dyn Hypervisor>,
        control_plane: Arc<dyn ControlPlane>,
        reconciler: Arc<Reconciler>,
        cache: Arc<ConfigCache>,
        connections: ConnectionReader,
        pull_trigger: PullTrigger,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            hypervisor,
            control_plane,
            reconciler,
            cache,
            connections,
            snapshots: RwLock::new(SnapshotStore::new()),
            pull_trigger,
            metrics: AgentMetrics::new(),
            logger,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn snapshot_summary(&self) -> SnapshotSummary {
        self.snapshots.read().await.summary(Instant::now())
    }

    async fn observe(&self) -> Observation {
        let desired = self.reconciler.desired_workers().await;

        let actual = if self.hypervisor.is_started() {
            match self.hypervisor.list_workers().await {
                Ok(actual) => Some(actual),
                Err(e) => {
                    warn!(error = %e, "Worker list unavailable; reporting cached config");
                    None
                }
            }
        } else {
            None
        };

        let (devices, metrics, workers, fallback) = match actual {
            Some(actual) => {
                let devices = match self.hypervisor.list_devices().await {
                    Ok(devices) => {
                        self.cache.set_gpus(devices.clone()).await;
                        devices
                    }
                    Err(e) => {
                        debug!(error = %e, "Device list unavailable; using cached GPUs");
                        self.cache.gpus().await
                    }
                };
                let metrics = self.hypervisor.device_metrics().await.unwrap_or_else(|e| {
                    debug!(error = %e, "Device metrics unavailable");
                    HashMap::new()
                });
                (devices, metrics, derive_worker_statuses(&desired, &actual), false)
            }
            None => {
                let workers: Vec<ObservedWorker> = self
                    .cache
                    .workers()
                    .await
                    .into_iter()
                    .map(|w| ObservedWorker {
                        status: if w.enabled {
                            WorkerStatus::Pending
                        } else {
                            WorkerStatus::Stopped
                        },
                        worker_id: w.worker_id,
                        pid: None,
                        restart_count: 0,
                        gpu_ids: w.gpu_ids,
                    })
                    .collect();
                (self.cache.gpus().await, HashMap::new(), workers, true)
            }
        };

        let worker_ids: Vec<&str> = workers.iter().map(|w| w.worker_id.as_str()).collect();
        let connections = self.connections.read_all(worker_ids).await;

        Observation {
            devices,
            metrics,
            workers,
            connections,
            fallback,
        }
    }

    /// Observe, diff against the snapshots and replace them.
    ///
    /// Snapshots are replaced before anything is sent, so a failed send loses
    /// this cycle's delta.
    pub async fn build_report(&self) -> CycleReport {
        let observation = self.observe().await;
        let license_expiration = self
            .cache
            .license()
            .await
            .and_then(|l| l.expiration_ms());

        let mut snapshots = self.snapshots.write().await;
        let forced = snapshots.should_force_refresh(Instant::now(), self.config.force_refresh_interval);
        let all_changed = forced || observation.fallback;

        let mut gpus = Vec::new();
        let mut gpu_snapshots = HashMap::new();
        let mut changed_gpus = HashSet::new();
        for device in &observation.devices {
            let snap = GpuSnapshot::from(device);
            let changed = all_changed || snapshots.gpu_changed(&device.gpu_id, &snap);
            if changed {
                changed_gpus.insert(device.gpu_id.clone());
            }
            let metrics = observation.metrics.get(&device.gpu_id);
            gpus.push(GpuStatusReport {
                gpu_id: device.gpu_id.clone(),
                vendor: device.vendor.to_string(),
                model: device.model.clone(),
                vram_mb: device.vram_mb,
                driver_version: device.driver_version.clone(),
                runtime_version: device.runtime_version.clone(),
                utilization_percent: metrics.map(|m| m.utilization_percent),
                memory_used_mb: metrics.map(|m| m.memory_used_mb),
                present: true,
                gpu_changed: changed,
            });
            gpu_snapshots.insert(device.gpu_id.clone(), snap);
        }

        let current_gpus: HashSet<&str> = observation.devices.iter().map(|d| d.gpu_id.as_str()).collect();
        for (gpu_id, prior) in snapshots.vanished_gpus(&current_gpus) {
            changed_gpus.insert(gpu_id.clone());
            gpus.push(GpuStatusReport {
                gpu_id,
                vendor: prior.vendor.to_string(),
                model: prior.model,
                vram_mb: prior.vram_mb,
                driver_version: prior.driver_version,
                runtime_version: prior.runtime_version,
                utilization_percent: None,
                memory_used_mb: None,
                present: false,
                gpu_changed: true,
            });
        }

        let mut workers = Vec::new();
        let mut worker_snapshots = HashMap::new();
        let mut connection_snapshots = HashMap::new();
        for observed in &observation.workers {
            let snap = observed.snapshot();
            let connections = observation
                .connections
                .get(&observed.worker_id)
                .cloned()
                .unwrap_or_default();

            let worker_changed = all_changed || snapshots.worker_changed(&observed.worker_id, &snap);
            let connection_changed =
                all_changed || snapshots.connections_changed(&observed.worker_id, &connections);
            let gpu_changed = all_changed || observed.gpu_ids.iter().any(|id| changed_gpus.contains(id));

            workers.push(WorkerStatusReport {
                worker_id: observed.worker_id.clone(),
                status: observed.status,
                pid: observed.pid,
                restart_count: observed.restart_count,
                gpu_ids: observed.gpu_ids.clone(),
                connections: connections.iter().cloned().collect(),
                worker_changed,
                connection_changed,
                gpu_changed,
            });
            worker_snapshots.insert(observed.worker_id.clone(), snap);
            connection_snapshots.insert(observed.worker_id.clone(), connections);
        }

        let current_workers: HashSet<&str> = observation.workers.iter().map(|w| w.worker_id.as_str()).collect();
        for (worker_id, prior) in snapshots.vanished_workers(&current_workers) {
            workers.push(WorkerStatusReport {
                worker_id,
                status: WorkerStatus::Stopped,
                pid: None,
                restart_count: prior.restart_count,
                gpu_ids: prior.gpu_ids,
                connections: Vec::new(),
                worker_changed: true,
                connection_changed: true,
                gpu_changed: false,
            });
        }

        snapshots.replace(gpu_snapshots, worker_snapshots, connection_snapshots);
        drop(snapshots);

        CycleReport {
            report: StatusReport {
                gpus,
                workers,
                license_expiration,
            },
            forced,
            fallback: observation.fallback,
        }
    }

    /// Run one full cycle: build, send, react to the response
    pub async fn report_once(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let cycle = self.build_report().await;

        let sent = self
            .control_plane
            .push_status(&self.agent_id, &cycle.report)
            .await
            .context("Status report failed");

        let elapsed = started.elapsed().as_secs_f64();
        let counts = self.reconciler.get_status().await;
        self.metrics
            .set_worker_counts(counts.desired_count, counts.actual_count);
        self.metrics.observe_status_report(elapsed, sent.is_ok());
        self.metrics.set_license_expiry(cycle.report.license_expiration);
        self.logger.log_status_reported(
            cycle.report.gpus.len(),
            cycle.report.workers.len(),
            cycle.changed_workers(),
            cycle.forced,
            sent.is_ok(),
        );

        let response = sent?;

        let held = self.cache.version().await;
        if held.map_or(true, |v| response.config_version > v) && response.config_version > 0 {
            info!(
                held = ?held,
                offered = response.config_version,
                "Control plane has a newer config"
            );
            self.pull_trigger.request();
        }

        if let Some(license) = response.license {
            let expiry = license.expiration_ms();
            if self.cache.set_license(license).await {
                self.metrics.set_license_expiry(expiry);
                self.logger.log_license_updated(expiry);
            }
        }

        Ok(cycle)
    }

    /// Report on every tick until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = periodic("status", self.config.interval);

        info!(
            interval_secs = self.config.interval.as_secs(),
            force_refresh_secs = self.config.force_refresh_interval.as_secs(),
            "Status loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = self.report_once().await;
            if let Err(e) = &result {
                warn!(error = %e, "Status report failed; snapshots already advanced");
            }
            if let Some(health) = &self.health {
                let health_result = match &result {
                    Ok(cycle) if cycle.fallback => Err("hypervisor unavailable, reported cached config".to_string()),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                };
                // Boxed to pin the Send check to concrete lifetimes (rustc HRTB limitation)
                let record: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> =
                    Box::pin(health.record(components::STATUS_REPORTER, &health_result));
                record.await;
            }
        }

        info!("Status loop stopped");
    }
}
