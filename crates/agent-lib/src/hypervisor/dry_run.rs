//! In-memory hypervisor that records launches without spawning processes
//!
//! Used for bring-up on hosts without GPUs and as the facade in tests.

use super::devices::DeviceSource;
use super::Hypervisor;
use crate::error::{HypervisorError, HypervisorResult};
use crate::models::{Device, DeviceMetrics, WorkerActual, WorkerSpec};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// A facade call recorded by the dry-run backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    Start(String),
    Stop(String),
    UpdateEnv(String),
}

/// Hypervisor backend that only tracks state in memory
pub struct DryRunHypervisor {
    devices: Arc<dyn DeviceSource>,
    workers: DashMap<String, WorkerActual>,
    started: AtomicBool,
    calls: Mutex<Vec<HypervisorCall>>,
}

impl DryRunHypervisor {
    pub fn new(devices: Arc<dyn DeviceSource>) -> Self {
        Self {
            devices,
            workers: DashMap::new(),
            started: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls made since creation or the last [`Self::take_calls`]
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn take_calls(&self) -> Vec<HypervisorCall> {
        self.calls
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }

    /// Simulate a worker crash: the entry stays but stops running
    pub fn mark_exited(&self, worker_id: &str) {
        if let Some(mut entry) = self.workers.get_mut(worker_id) {
            entry.running = false;
            entry.pid = None;
        }
    }

    fn record(&self, call: HypervisorCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn ensure_started(&self) -> HypervisorResult<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HypervisorError::NotStarted)
        }
    }
}

#[async_trait]
impl Hypervisor for DryRunHypervisor {
    async fn start(&self) -> HypervisorResult<()> {
        self.started.store(true, Ordering::SeqCst);
        info!("Dry-run hypervisor started");
        Ok(())
    }

    async fn stop(&self) -> HypervisorResult<()> {
        self.started.store(false, Ordering::SeqCst);
        self.workers.clear();
        info!("Dry-run hypervisor stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
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
        let mut workers: Vec<WorkerActual> =
            self.workers.iter().map(|r| r.value().clone()).collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn start_worker(&self, spec: &WorkerSpec) -> HypervisorResult<()> {
        self.ensure_started()?;
        if self.workers.contains_key(&spec.worker_id) {
            return Err(HypervisorError::WorkerAlreadyExists(spec.worker_id.clone()));
        }
        self.record(HypervisorCall::Start(spec.worker_id.clone()));
        self.workers.insert(
            spec.worker_id.clone(),
            WorkerActual {
                worker_id: spec.worker_id.clone(),
                running: true,
                pid: None,
                restart_count: 0,
                gpu_ids: spec.gpu_ids.clone(),
                command: spec.command.clone(),
            },
        );
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> HypervisorResult<()> {
        self.ensure_started()?;
        self.record(HypervisorCall::Stop(worker_id.to_string()));
        self.workers
            .remove(worker_id)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::WorkerNotFound(worker_id.to_string()))
    }

    async fn update_worker_env(
        &self,
        worker_id: &str,
        env: &HashMap<String, String>,
    ) -> HypervisorResult<()> {
        self.ensure_started()?;
        self.record(HypervisorCall::UpdateEnv(worker_id.to_string()));
        let mut entry = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| HypervisorError::WorkerNotFound(worker_id.to_string()))?;
        entry.command.env = env.clone();
        Ok(())
    }

    async fn device_metrics(&self) -> HypervisorResult<HashMap<String, DeviceMetrics>> {
        self.ensure_started()?;
        self.devices
            .metrics()
            .await
            .map_err(|e| HypervisorError::Device(e.to_string()))
    }
}
