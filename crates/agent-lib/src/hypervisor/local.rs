//! Hypervisor backend that runs worker binaries as local processes
//!
//! Each worker is launched as its own process-group leader so termination can
//! reach anything it spawns. A supervisor task per worker reaps the process and
//! relaunches it after an unexpected exit, picking up environment changes made
//! through `update_worker_env`.

use super::devices::DeviceSource;
use super::Hypervisor;
use crate::error::{HypervisorError, HypervisorResult, ProcessError};
use crate::models::{Device, DeviceMetrics, WorkerActual, WorkerSpec};
use crate::process::{LifecycleConfig, ProcessLifecycleManager};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the local process backend
#[derive(Debug, Clone)]
pub struct LocalHypervisorConfig {
    /// Delay before the first relaunch of a crashed worker
    pub restart_backoff: Duration,
    /// Upper bound for the relaunch delay
    pub max_restart_backoff: Duration,
    /// Termination policy for `stop_worker`
    pub lifecycle: LifecycleConfig,
}

impl Default for LocalHypervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(1),
            max_restart_backoff: Duration::from_secs(60),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

struct ManagedWorker {
    spec: WorkerSpec,
    pid: Option<u32>,
    running: bool,
    restart_count: u32,
    stopping: bool,
    /// Identifies the launch this entry belongs to; a supervisor only touches
    /// entries carrying its own generation
    generation: u64,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl ManagedWorker {
    fn to_actual(&self) -> WorkerActual {
        WorkerActual {
            worker_id: self.spec.worker_id.clone(),
            running: self.running,
            pid: self.pid,
            restart_count: self.restart_count,
            gpu_ids: self.spec.gpu_ids.clone(),
            command: self.spec.command.clone(),
        }
    }

    fn owned_by(&self, generation: u64) -> bool {
        self.generation == generation && !self.stopping
    }

    /// Mark the entry as stopping and release its supervisor
    fn begin_stop(&mut self) -> (Option<u32>, Option<JoinHandle<()>>) {
        self.stopping = true;
        self.cancel.cancel();
        (self.pid, self.supervisor.take())
    }
}

/// Shared state handed to supervisor tasks
struct Shared {
    config: LocalHypervisorConfig,
    workers: DashMap<String, ManagedWorker>,
    started: AtomicBool,
    recovery: AtomicBool,
    next_generation: AtomicU64,
    lifecycle: ProcessLifecycleManager,
}

impl Shared {
    fn relaunch_allowed(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.recovery.load(Ordering::SeqCst)
    }
}

/// Hypervisor backend supervising worker OS processes directly
pub struct LocalProcessHypervisor {
    devices: Arc<dyn DeviceSource>,
    shared: Arc<Shared>,
}

impl LocalProcessHypervisor {
    pub fn new(config: LocalHypervisorConfig, devices: Arc<dyn DeviceSource>) -> Self {
        let lifecycle = ProcessLifecycleManager::new(config.lifecycle.clone());
        Self {
            devices,
            shared: Arc::new(Shared {
                config,
                workers: DashMap::new(),
                started: AtomicBool::new(false),
                recovery: AtomicBool::new(true),
                next_generation: AtomicU64::new(1),
                lifecycle,
            }),
        }
    }

    fn ensure_started(&self) -> HypervisorResult<()> {
        if self.shared.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HypervisorError::NotStarted)
        }
    }

    /// Reject GPU ids this host does not have
    async fn check_allocation(&self, spec: &WorkerSpec) -> HypervisorResult<()> {
        let devices = self
            .devices
            .discover()
            .await
            .map_err(|e| HypervisorError::Device(e.to_string()))?;
        if devices.is_empty() {
            // Nothing to validate against on hosts without an inventory
            return Ok(());
        }

        let known: HashSet<&str> = devices.iter().map(|d| d.gpu_id.as_str()).collect();
        if let Some(unknown) = spec.gpu_ids.iter().find(|id| !known.contains(id.as_str())) {
            return Err(HypervisorError::launch(
                &spec.worker_id,
                format!("GPU {} is not present on this host", unknown),
            ));
        }
        Ok(())
    }
}

fn spawn_worker(spec: &WorkerSpec) -> std::io::Result<Child> {
    let mut command = Command::new(&spec.command.executable);
    command
        .args(&spec.command.args)
        .envs(&spec.command.env)
        .stdin(Stdio::null())
        .kill_on_drop(false);
    if let Some(dir) = &spec.command.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);

    command.spawn()
}

/// Wait for a supervisor to exit, aborting it if it does not
async fn join_supervisor(worker_id: &str, mut handle: JoinHandle<()>) {
    if tokio::time::timeout(Duration::from_secs(1), &mut handle)
        .await
        .is_err()
    {
        debug!(worker_id = %worker_id, "Supervisor task still running after stop, aborting");
        handle.abort();
    }
}

/// Reap the worker and relaunch it after unexpected exits.
///
/// The task gives up as soon as `cancel` fires or the map entry for
/// `worker_id` belongs to a different launch generation.
async fn supervise(
    shared: Arc<Shared>,
    worker_id: String,
    generation: u64,
    cancel: CancellationToken,
    mut child: Child,
) {
    let mut backoff = shared.config.restart_backoff;

    loop {
        let launched_at = Instant::now();
        let status = child.wait().await;

        let relaunch = {
            let Some(mut entry) = shared.workers.get_mut(&worker_id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.running = false;
            entry.pid = None;
            !entry.stopping && shared.relaunch_allowed()
        };

        match &status {
            Ok(s) => info!(worker_id = %worker_id, status = %s, "Worker process exited"),
            Err(e) => warn!(worker_id = %worker_id, error = %e, "Failed to wait on worker process"),
        }

        if !relaunch {
            return;
        }

        if launched_at.elapsed() > shared.config.max_restart_backoff {
            backoff = shared.config.restart_backoff;
        }

        child = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, shared.config.max_restart_backoff);

            let spec = {
                let Some(entry) = shared.workers.get(&worker_id) else {
                    return;
                };
                if !entry.owned_by(generation) || !shared.relaunch_allowed() {
                    return;
                }
                entry.spec.clone()
            };

            match spawn_worker(&spec) {
                Ok(child) => break child,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Failed to relaunch worker");
                }
            }
        };

        let pid = child.id();
        let abandoned = match shared.workers.get_mut(&worker_id) {
            Some(mut entry) if entry.owned_by(generation) => {
                entry.pid = pid;
                entry.running = true;
                entry.restart_count += 1;
                info!(
                    worker_id = %worker_id,
                    pid = ?pid,
                    restart_count = entry.restart_count,
                    "Worker relaunched after exit"
                );
                false
            }
            _ => true,
        };

        if abandoned {
            // stop_worker raced the relaunch and could not see this pid. The
            // cleanup runs detached so aborting this task cannot orphan it.
            let lifecycle = shared.lifecycle.clone();
            tokio::spawn(async move {
                if let Some(pid) = pid {
                    lifecycle.terminate(pid).await;
                }
                let _ = child.wait().await;
            });
            return;
        }
    }
}

#[async_trait]
impl Hypervisor for LocalProcessHypervisor {
    async fn start(&self) -> HypervisorResult<()> {
        let devices = self
            .devices
            .discover()
            .await
            .map_err(|e| HypervisorError::Device(e.to_string()))?;
        self.shared.recovery.store(true, Ordering::SeqCst);
        self.shared.started.store(true, Ordering::SeqCst);
        info!(devices = devices.len(), "Local process hypervisor started");
        Ok(())
    }

    async fn stop(&self) -> HypervisorResult<()> {
        if !self.shared.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pids = Vec::new();
        let mut supervisors = Vec::new();
        for mut entry in self.shared.workers.iter_mut() {
            let (pid, supervisor) = entry.begin_stop();
            pids.extend(pid);
            if let Some(handle) = supervisor {
                supervisors.push((entry.key().clone(), handle));
            }
        }

        let report = self.shared.lifecycle.terminate_all(&pids).await;
        for (worker_id, handle) in supervisors {
            join_supervisor(&worker_id, handle).await;
        }
        self.shared.workers.clear();

        info!(
            graceful = report.graceful.len(),
            killed = report.killed.len(),
            "Local process hypervisor stopped"
        );
        if let Some(pid) = report.survivors.first() {
            return Err(ProcessError::Signal {
                pid: *pid,
                reason: "process survived forceful kill".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    async fn list_devices(&self) -> HypervisorResult<Vec<Device>> {
        self.ensure_started()?;
        self.devices
            .discover()
            .await
            .map_err(|e| HypervisorError::Device(e.to_string()))
    }

    async fn list_workers(&self) -> HypervisorResult<Vec<WorkerActual>> {
        self.ensure_started()?;
        let mut workers: Vec<WorkerActual> = self
            .shared
            .workers
            .iter()
            .filter(|entry| !entry.stopping)
            .map(|entry| entry.to_actual())
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn start_worker(&self, spec: &WorkerSpec) -> HypervisorResult<()> {
        self.ensure_started()?;
        if self.shared.workers.contains_key(&spec.worker_id) {
            return Err(HypervisorError::WorkerAlreadyExists(spec.worker_id.clone()));
        }
        self.check_allocation(spec).await?;

        let child = spawn_worker(spec).map_err(|e| HypervisorError::launch(&spec.worker_id, e))?;
        let pid = child.id();
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        self.shared.workers.insert(
            spec.worker_id.clone(),
            ManagedWorker {
                spec: spec.clone(),
                pid,
                running: true,
                restart_count: 0,
                stopping: false,
                generation,
                cancel: cancel.clone(),
                supervisor: None,
            },
        );

        let handle = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            spec.worker_id.clone(),
            generation,
            cancel,
            child,
        ));
        if let Some(mut entry) = self.shared.workers.get_mut(&spec.worker_id) {
            entry.supervisor = Some(handle);
        }

        info!(
            worker_id = %spec.worker_id,
            pid = ?pid,
            gpus = ?spec.gpu_ids,
            "Worker launched"
        );
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> HypervisorResult<()> {
        self.ensure_started()?;

        let (pid, supervisor) = {
            let mut entry = self
                .shared
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| HypervisorError::WorkerNotFound(worker_id.to_string()))?;
            entry.begin_stop()
        };

        let report = match pid {
            Some(pid) => Some(self.shared.lifecycle.terminate(pid).await),
            None => None,
        };

        if let Some(handle) = supervisor {
            join_supervisor(worker_id, handle).await;
        }
        self.shared
            .workers
            .remove_if(worker_id, |_, entry| entry.stopping);

        info!(worker_id = %worker_id, pid = ?pid, "Worker stopped");
        match report {
            Some(report) if !report.is_clean() => Err(ProcessError::Signal {
                pid: report.survivors[0],
                reason: "process survived forceful kill".to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    async fn update_worker_env(
        &self,
        worker_id: &str,
        env: &HashMap<String, String>,
    ) -> HypervisorResult<()> {
        self.ensure_started()?;
        let mut entry = self
            .shared
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| HypervisorError::WorkerNotFound(worker_id.to_string()))?;
        entry.spec.command.env = env.clone();
        debug!(worker_id = %worker_id, vars = env.len(), "Worker environment updated for next launch");
        Ok(())
    }

    async fn device_metrics(&self) -> HypervisorResult<HashMap<String, DeviceMetrics>> {
        self.ensure_started()?;
        self.devices
            .metrics()
            .await
            .map_err(|e| HypervisorError::Device(e.to_string()))
    }

    fn suspend_recovery(&self) {
        self.shared.recovery.store(false, Ordering::SeqCst);
    }
}
