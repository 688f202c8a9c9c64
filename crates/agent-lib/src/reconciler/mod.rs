//! Worker reconciliation
//!
//! This module provides:
//! - The desired worker set and the pending force-restart set
//! - A periodic and wake-on-change loop that converges the facade onto that set
//! - Single-pass reconciliation for callers that need a synchronous result

mod plan;


pub use plan::{env_differs, plan, structurally_differs, RestartReason, WorkerAction};

use crate::error::HypervisorError;
use crate::hypervisor::Hypervisor;
use crate::models::WorkerSpec;
use crate::ticker::periodic;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the reconciler loop
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period between passes when nothing wakes the loop
    pub interval: Duration,
    /// Pause between stopping and relaunching a restarted worker
    pub restart_settle_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            restart_settle_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub failed: usize,
}

impl ReconcileResult {
    pub fn changed(&self) -> bool {
        self.added + self.removed + self.updated > 0
    }
}

/// Desired vs actual counts as seen right now
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStatus {
    /// Enabled desired workers only
    pub desired_count: usize,
    pub actual_count: usize,
    pub in_sync: bool,
}

/// Invoked after every completed pass with its result and duration
pub type ReconcileCallback = Arc<dyn Fn(&ReconcileResult, Duration) + Send + Sync>;

#[derive(Default)]
struct DesiredState {
    workers: HashMap<String, WorkerSpec>,
    force_restart: HashSet<String>,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<mpsc::Receiver<()>>,
}

/// Converges facade-managed workers onto the desired set
pub struct Reconciler {
    hypervisor: Arc<dyn Hypervisor>,
    config: ReconcilerConfig,
    state: RwLock<DesiredState>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    running: Mutex<Option<LoopHandle>>,
    pass_lock: Mutex<()>,
    on_result: Option<ReconcileCallback>,
}

impl Reconciler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, config: ReconcilerConfig) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            hypervisor,
            config,
            state: RwLock::new(DesiredState::default()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            running: Mutex::new(None),
            pass_lock: Mutex::new(()),
            on_result: None,
        }
    }

    /// Register the callback run after each pass
    pub fn with_callback(mut self, callback: ReconcileCallback) -> Self {
        self.on_result = Some(callback);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Replace the desired worker set and wake the loop
    pub async fn set_desired_workers(&self, specs: Vec<WorkerSpec>) {
        let count = specs.len();
        {
            let mut state = self.state.write().await;
            state.workers = specs
                .into_iter()
                .map(|spec| (spec.worker_id.clone(), spec))
                .collect();
        }
        debug!(workers = count, "Desired worker set replaced");
        self.wake();
    }

    /// Queue ids for a forced restart on the next pass.
    ///
    /// Returns how many ids were not already queued.
    pub async fn request_worker_restarts<I, S>(&self, worker_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queued = {
            let mut state = self.state.write().await;
            worker_ids
                .into_iter()
                .map(Into::into)
                .filter(|id: &String| state.force_restart.insert(id.clone()))
                .count()
        };
        if queued > 0 {
            info!(queued = queued, "Worker restarts requested");
        }
        self.wake();
        queued
    }

    /// Snapshot of the desired worker set
    pub async fn desired_workers(&self) -> Vec<WorkerSpec> {
        let state = self.state.read().await;
        let mut specs: Vec<WorkerSpec> = state.workers.values().cloned().collect();
        specs.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        specs
    }

    pub async fn pending_restarts(&self) -> usize {
        self.state.read().await.force_restart.len()
    }

    /// Launch the background loop. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>, shutdown: &CancellationToken) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let Some(wake_rx) = self.wake_rx.lock().await.take() else {
            warn!("Reconciler wake channel unavailable; loop not started");
            return;
        };

        let cancel = shutdown.child_token();
        let task = tokio::spawn(Arc::clone(self).run(wake_rx, cancel.clone()));
        *running = Some(LoopHandle { cancel, task });
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Reconciler started"
        );
    }

    /// Stop the loop and wait for an in-flight pass. Safe without `start`.
    pub async fn stop(&self) {
        let Some(handle) = self.running.lock().await.take() else {
            return;
        };
        handle.cancel.cancel();
        match handle.task.await {
            Ok(wake_rx) => {
                *self.wake_rx.lock().await = Some(wake_rx);
            }
            Err(e) => error!(error = %e, "Reconciler task ended abnormally"),
        }
        info!("Reconciler stopped");
    }

    async fn run(
        self: Arc<Self>,
        mut wake_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<()> {
        let mut ticker = periodic("reconciler", self.config.interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = wake_rx.recv() => {}
            }

            if let Err(e) = self.reconcile_once().await {
                warn!(error = %e, "Reconciliation pass failed");
            }
        }

        wake_rx
    }

    /// Run one pass now. Passes never overlap.
    pub async fn reconcile_once(&self) -> Result<ReconcileResult> {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();

        let (desired, force) = {
            let mut state = self.state.write().await;
            (
                state.workers.clone(),
                std::mem::take(&mut state.force_restart),
            )
        };

        let actual = match self.hypervisor.list_workers().await {
            Ok(actual) => actual,
            Err(e) => {
                self.requeue(force).await;
                return Err(e).context("Failed to list workers");
            }
        };

        let actions = plan(&desired, &actual, &force);
        let mut result = ReconcileResult::default();
        let mut failed_restarts = Vec::new();

        for action in actions {
            match action {
                WorkerAction::Start(spec) => match self.hypervisor.start_worker(&spec).await {
                    Ok(()) => {
                        info!(worker_id = %spec.worker_id, gpus = ?spec.gpu_ids, "Worker started");
                        result.added += 1;
                    }
                    Err(e) => {
                        warn!(worker_id = %spec.worker_id, error = %e, "Failed to start worker");
                        result.failed += 1;
                    }
                },
                WorkerAction::Restart { spec, reason } => match self.restart(&spec).await {
                    Ok(()) => {
                        info!(worker_id = %spec.worker_id, reason = ?reason, "Worker restarted");
                        result.updated += 1;
                    }
                    Err(e) => {
                        warn!(
                            worker_id = %spec.worker_id,
                            reason = ?reason,
                            error = %e,
                            "Failed to restart worker"
                        );
                        result.failed += 1;
                        if reason == RestartReason::Forced {
                            failed_restarts.push(spec.worker_id.clone());
                        }
                    }
                },
                WorkerAction::UpdateEnv { worker_id, env } => {
                    match self.hypervisor.update_worker_env(&worker_id, &env).await {
                        Ok(()) => {
                            debug!(worker_id = %worker_id, "Worker environment updated");
                            result.updated += 1;
                        }
                        Err(e) => {
                            warn!(worker_id = %worker_id, error = %e, "Failed to update worker environment");
                            result.failed += 1;
                        }
                    }
                }
                WorkerAction::Stop(worker_id) => match self.hypervisor.stop_worker(&worker_id).await {
                    Ok(()) | Err(HypervisorError::WorkerNotFound(_)) => {
                        info!(worker_id = %worker_id, "Worker stopped");
                        result.removed += 1;
                    }
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Failed to stop worker");
                        result.failed += 1;
                    }
                },
            }
        }

        if !failed_restarts.is_empty() {
            self.requeue(failed_restarts).await;
        }

        if result.changed() || result.failed > 0 {
            info!(
                added = result.added,
                removed = result.removed,
                updated = result.updated,
                failed = result.failed,
                duration_ms = started.elapsed().as_millis() as u64,
                "Reconciliation pass completed"
            );
        } else {
            debug!("Workers in sync");
        }

        if let Some(callback) = &self.on_result {
            callback(&result, started.elapsed());
        }

        Ok(result)
    }

    /// Stop then relaunch. The start is skipped when the stop failed.
    async fn restart(&self, spec: &WorkerSpec) -> Result<(), HypervisorError> {
        match self.hypervisor.stop_worker(&spec.worker_id).await {
            Ok(()) | Err(HypervisorError::WorkerNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.config.restart_settle_delay.is_zero() {
            tokio::time::sleep(self.config.restart_settle_delay).await;
        }
        self.hypervisor.start_worker(spec).await
    }

    async fn requeue(&self, ids: impl IntoIterator<Item = String>) {
        let mut state = self.state.write().await;
        state.force_restart.extend(ids);
    }

    /// Compare enabled desired workers with what the facade reports
    pub async fn get_status(&self) -> ReconcilerStatus {
        let enabled: HashSet<String> = {
            let state = self.state.read().await;
            state
                .workers
                .values()
                .filter(|s| s.enabled)
                .map(|s| s.worker_id.clone())
                .collect()
        };

        match self.hypervisor.list_workers().await {
            Ok(actual) => {
                let actual_ids: HashSet<&str> =
                    actual.iter().map(|w| w.worker_id.as_str()).collect();
                let in_sync = actual_ids.len() == enabled.len()
                    && enabled.iter().all(|id| actual_ids.contains(id.as_str()));
                ReconcilerStatus {
                    desired_count: enabled.len(),
                    actual_count: actual.len(),
                    in_sync,
                }
            }
            Err(e) => {
                debug!(error = %e, "Worker list unavailable for status");
                ReconcilerStatus {
                    desired_count: enabled.len(),
                    actual_count: 0,
                    in_sync: false,
                }
            }
        }
    }

    fn wake(&self) {
        // A full channel already guarantees a pending pass
        let _ = self.wake_tx.try_send(());
    }
}
