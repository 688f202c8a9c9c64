//! Observability infrastructure for the fleet agent
//!
//! Provides:
//! - Prometheus metrics (reconcile latency, worker operations, status reporting)
//! - Structured JSON logging of agent transitions with tracing

use crate::reconciler::ReconcileResult;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for pass and report latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    reconcile_duration_seconds: Histogram,
    workers_started: IntCounter,
    workers_stopped: IntCounter,
    workers_updated: IntCounter,
    worker_operation_failures: IntCounter,
    workers_desired: IntGauge,
    workers_actual: IntGauge,
    config_version: IntGauge,
    license_expiry_seconds: IntGauge,
    status_report_duration_seconds: Histogram,
    status_report_failures: IntCounter,
    restart_requests: IntCounter,
    event_stream_reconnects: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "fleet_agent_reconcile_duration_seconds",
                "Time spent in one reconciliation pass",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            workers_started: register_int_counter!(
                "fleet_agent_workers_started_total",
                "Workers started by the reconciler"
            )
            .expect("Failed to register workers_started"),

            workers_stopped: register_int_counter!(
                "fleet_agent_workers_stopped_total",
                "Workers stopped by the reconciler"
            )
            .expect("Failed to register workers_stopped"),

            workers_updated: register_int_counter!(
                "fleet_agent_workers_updated_total",
                "Workers restarted or updated in place by the reconciler"
            )
            .expect("Failed to register workers_updated"),

            worker_operation_failures: register_int_counter!(
                "fleet_agent_worker_operation_failures_total",
                "Failed start, stop, restart or env-update operations"
            )
            .expect("Failed to register worker_operation_failures"),

            workers_desired: register_int_gauge!(
                "fleet_agent_workers_desired",
                "Enabled workers in the desired set"
            )
            .expect("Failed to register workers_desired"),

            workers_actual: register_int_gauge!(
                "fleet_agent_workers_actual",
                "Workers reported by the hypervisor"
            )
            .expect("Failed to register workers_actual"),

            config_version: register_int_gauge!(
                "fleet_agent_config_version",
                "Version of the applied control-plane config"
            )
            .expect("Failed to register config_version"),

            license_expiry_seconds: register_int_gauge!(
                "fleet_agent_license_expiry_timestamp_seconds",
                "License expiry as a unix timestamp, 0 when unknown"
            )
            .expect("Failed to register license_expiry_seconds"),

            status_report_duration_seconds: register_histogram!(
                "fleet_agent_status_report_duration_seconds",
                "Time spent building and sending one status report",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register status_report_duration_seconds"),

            status_report_failures: register_int_counter!(
                "fleet_agent_status_report_failures_total",
                "Status reports the control plane did not accept"
            )
            .expect("Failed to register status_report_failures"),

            restart_requests: register_int_counter!(
                "fleet_agent_restart_requests_total",
                "Worker restarts queued from push events"
            )
            .expect("Failed to register restart_requests"),

            event_stream_reconnects: register_int_counter!(
                "fleet_agent_event_stream_reconnects_total",
                "Reconnect attempts of the server-push event stream"
            )
            .expect("Failed to register event_stream_reconnects"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same collectors.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn record_reconcile(&self, result: &ReconcileResult, duration_secs: f64) {
        let inner = self.inner();
        inner.reconcile_duration_seconds.observe(duration_secs);
        inner.workers_started.inc_by(result.added as u64);
        inner.workers_stopped.inc_by(result.removed as u64);
        inner.workers_updated.inc_by(result.updated as u64);
        inner.worker_operation_failures.inc_by(result.failed as u64);
    }

    pub fn set_worker_counts(&self, desired: usize, actual: usize) {
        self.inner().workers_desired.set(desired as i64);
        self.inner().workers_actual.set(actual as i64);
    }

    pub fn set_config_version(&self, version: u64) {
        self.inner().config_version.set(version as i64);
    }

    pub fn set_license_expiry(&self, expiry_ms: Option<i64>) {
        self.inner()
            .license_expiry_seconds
            .set(expiry_ms.map(|ms| ms / 1000).unwrap_or(0));
    }

    pub fn observe_status_report(&self, duration_secs: f64, success: bool) {
        self.inner()
            .status_report_duration_seconds
            .observe(duration_secs);
        if !success {
            self.inner().status_report_failures.inc();
        }
    }

    pub fn inc_restart_requests(&self, count: usize) {
        self.inner().restart_requests.inc_by(count as u64);
    }

    pub fn inc_event_reconnects(&self) {
        self.inner().event_stream_reconnects.inc();
    }
}

/// Structured logger for agent events
///
/// One named `event` field per significant transition so log pipelines can
/// filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    agent_id: String,
    node_name: String,
}

impl StructuredLogger {
    pub fn new(agent_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, backend: &str) {
        info!(
            event = "agent_started",
            agent_id = %self.agent_id,
            node = %self.node_name,
            agent_version = %version,
            backend = %backend,
            "Fleet agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent_id = %self.agent_id,
            node = %self.node_name,
            reason = %reason,
            "Fleet agent shutting down"
        );
    }

    pub fn log_config_applied(&self, previous: Option<u64>, version: u64, workers: usize) {
        info!(
            event = "config_applied",
            agent_id = %self.agent_id,
            node = %self.node_name,
            previous_version = ?previous,
            version = version,
            workers = workers,
            "Applied control-plane config"
        );
    }

    pub fn log_reconcile(&self, result: &ReconcileResult) {
        if result.failed > 0 {
            warn!(
                event = "reconcile_completed",
                agent_id = %self.agent_id,
                added = result.added,
                removed = result.removed,
                updated = result.updated,
                failed = result.failed,
                "Reconciliation completed with failures"
            );
        } else if result.changed() {
            info!(
                event = "reconcile_completed",
                agent_id = %self.agent_id,
                added = result.added,
                removed = result.removed,
                updated = result.updated,
                "Reconciliation changed workers"
            );
        }
    }

    pub fn log_restart_requested(&self, worker_ids: &[String], queued: usize) {
        info!(
            event = "worker_restart_requested",
            agent_id = %self.agent_id,
            worker_ids = ?worker_ids,
            queued = queued,
            "Worker restart requested by control plane"
        );
    }

    pub fn log_license_updated(&self, expiration_ms: Option<i64>) {
        info!(
            event = "license_updated",
            agent_id = %self.agent_id,
            license_expiration = ?expiration_ms,
            "License updated"
        );
    }

    pub fn log_status_reported(
        &self,
        gpus: usize,
        workers: usize,
        changed_workers: usize,
        forced: bool,
        success: bool,
    ) {
        if success {
            info!(
                event = "status_reported",
                agent_id = %self.agent_id,
                gpus = gpus,
                workers = workers,
                changed_workers = changed_workers,
                force_refresh = forced,
                "Status reported"
            );
        } else {
            warn!(
                event = "status_reported",
                agent_id = %self.agent_id,
                gpus = gpus,
                workers = workers,
                changed_workers = changed_workers,
                force_refresh = forced,
                "Status report not delivered"
            );
        }
    }
}
