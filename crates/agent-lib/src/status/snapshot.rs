//! Change-detection snapshots
//!
//! Per-entity copies of the fields reported upstream, taken at the end of each
//! status cycle. Process-local only; an agent restart starts from empty
//! snapshots, so its first report marks everything changed.

use crate::models::{ConnectionSet, Device, GpuVendor, WorkerStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSnapshot {
    pub vendor: GpuVendor,
    pub model: String,
    pub vram_mb: u64,
    pub driver_version: String,
    pub runtime_version: String,
}

impl From<&Device> for GpuSnapshot {
    fn from(device: &Device) -> Self {
        Self {
            vendor: device.vendor,
            model: device.model.clone(),
            vram_mb: device.vram_mb,
            driver_version: device.driver_version.clone(),
            runtime_version: device.runtime_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    /// Sorted so allocation order does not register as a change
    pub gpu_ids: Vec<String>,
}

impl WorkerSnapshot {
    pub fn new(status: WorkerStatus, pid: Option<u32>, restart_count: u32, gpu_ids: &[String]) -> Self {
        let mut gpu_ids = gpu_ids.to_vec();
        gpu_ids.sort();
        Self {
            status,
            pid,
            restart_count,
            gpu_ids,
        }
    }
}

/// Diagnostic view of the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub gpus: usize,
    pub workers: usize,
    pub workers_with_connections: usize,
    pub seconds_since_force_refresh: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SnapshotStore {
    gpus: HashMap<String, GpuSnapshot>,
    workers: HashMap<String, WorkerSnapshot>,
    connections: HashMap<String, ConnectionSet>,
    last_force_refresh: Option<Instant>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True on the first call and whenever `interval` has elapsed since the
    /// last forced cycle; records `now` when it fires.
    pub fn should_force_refresh(&mut self, now: Instant, interval: Duration) -> bool {
        let due = match self.last_force_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        };
        if due {
            self.last_force_refresh = Some(now);
        }
        due
    }

    pub fn gpu_changed(&self, gpu_id: &str, current: &GpuSnapshot) -> bool {
        self.gpus.get(gpu_id) != Some(current)
    }

    pub fn worker_changed(&self, worker_id: &str, current: &WorkerSnapshot) -> bool {
        self.workers.get(worker_id) != Some(current)
    }

    pub fn connections_changed(&self, worker_id: &str, current: &ConnectionSet) -> bool {
        self.connections.get(worker_id) != Some(current)
    }

    /// GPUs in the prior snapshot that are absent from `current`
    pub fn vanished_gpus(&self, current: &HashSet<&str>) -> Vec<(String, GpuSnapshot)> {
        let mut gone: Vec<(String, GpuSnapshot)> = self
            .gpus
            .iter()
            .filter(|(id, _)| !current.contains(id.as_str()))
            .map(|(id, snap)| (id.clone(), snap.clone()))
            .collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        gone
    }

    /// Workers in the prior snapshot that are absent from `current`
    pub fn vanished_workers(&self, current: &HashSet<&str>) -> Vec<(String, WorkerSnapshot)> {
        let mut gone: Vec<(String, WorkerSnapshot)> = self
            .workers
            .iter()
            .filter(|(id, _)| !current.contains(id.as_str()))
            .map(|(id, snap)| (id.clone(), snap.clone()))
            .collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        gone
    }

    /// Replace every snapshot; vanished entities drop out here
    pub fn replace(
        &mut self,
        gpus: HashMap<String, GpuSnapshot>,
        workers: HashMap<String, WorkerSnapshot>,
        connections: HashMap<String, ConnectionSet>,
    ) {
        self.gpus = gpus;
        self.workers = workers;
        self.connections = connections;
    }

    pub fn summary(&self, now: Instant) -> SnapshotSummary {
        SnapshotSummary {
            gpus: self.gpus.len(),
            workers: self.workers.len(),
            workers_with_connections: self.connections.values().filter(|c| !c.is_empty()).count(),
            seconds_since_force_refresh: self
                .last_force_refresh
                .map(|last| now.saturating_duration_since(last).as_secs()),
        }
    }
}
