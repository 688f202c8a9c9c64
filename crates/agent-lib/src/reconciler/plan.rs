//! Desired/actual diffing
//!
//! Pure functions that turn a desired worker set, the observed worker set and
//! the drained force-restart ids into an ordered list of facade actions.

use crate::models::{WorkerActual, WorkerSpec};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Why a running worker is being restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Requested explicitly through `request_worker_restarts`
    Forced,
    /// GPU set, executable or arguments changed
    Structural,
}

/// One step the reconciler asks the facade to perform
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    Start(WorkerSpec),
    Restart {
        spec: WorkerSpec,
        reason: RestartReason,
    },
    UpdateEnv {
        worker_id: String,
        env: HashMap<String, String>,
    },
    Stop(String),
}

impl WorkerAction {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerAction::Start(spec) => &spec.worker_id,
            WorkerAction::Restart { spec, .. } => &spec.worker_id,
            WorkerAction::UpdateEnv { worker_id, .. } => worker_id,
            WorkerAction::Stop(worker_id) => worker_id,
        }
    }
}

/// True when the difference requires a process restart.
///
/// GPUs compare as an unordered set; arguments compare positionally.
pub fn structurally_differs(spec: &WorkerSpec, actual: &WorkerActual) -> bool {
    let desired_gpus: BTreeSet<&str> = spec.gpu_ids.iter().map(String::as_str).collect();
    let actual_gpus: BTreeSet<&str> = actual.gpu_ids.iter().map(String::as_str).collect();

    desired_gpus != actual_gpus
        || spec.command.executable != actual.command.executable
        || spec.command.args != actual.command.args
}

pub fn env_differs(spec: &WorkerSpec, actual: &WorkerActual) -> bool {
    spec.command.env != actual.command.env
}

/// Compute the actions for one reconciliation pass.
///
/// Order: starts, then restarts and env updates, then stops. Disabled desired
/// entries and orphans are both stopped. Force-restart ids for workers that
/// are not running are satisfied by the start itself.
pub fn plan(
    desired: &HashMap<String, WorkerSpec>,
    actual: &[WorkerActual],
    force_restart: &HashSet<String>,
) -> Vec<WorkerAction> {
    let actual_by_id: HashMap<&str, &WorkerActual> =
        actual.iter().map(|w| (w.worker_id.as_str(), w)).collect();

    let mut enabled: Vec<&WorkerSpec> = desired.values().filter(|s| s.enabled).collect();
    enabled.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    let mut starts = Vec::new();
    let mut changes = Vec::new();
    for spec in enabled {
        match actual_by_id.get(spec.worker_id.as_str()) {
            None => starts.push(WorkerAction::Start(spec.clone())),
            Some(current) => {
                if force_restart.contains(&spec.worker_id) {
                    changes.push(WorkerAction::Restart {
                        spec: spec.clone(),
                        reason: RestartReason::Forced,
                    });
                } else if structurally_differs(spec, current) {
                    changes.push(WorkerAction::Restart {
                        spec: spec.clone(),
                        reason: RestartReason::Structural,
                    });
                } else if env_differs(spec, current) {
                    changes.push(WorkerAction::UpdateEnv {
                        worker_id: spec.worker_id.clone(),
                        env: spec.command.env.clone(),
                    });
                }
            }
        }
    }

    let mut stops: Vec<WorkerAction> = actual
        .iter()
        .filter(|w| {
            desired
                .get(&w.worker_id)
                .map(|spec| !spec.enabled)
                .unwrap_or(true)
        })
        .map(|w| WorkerAction::Stop(w.worker_id.clone()))
        .collect();
    stops.sort_by(|a, b| a.worker_id().cmp(b.worker_id()));

    starts.into_iter().chain(changes).chain(stops).collect()
}
