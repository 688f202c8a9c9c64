//! Status pipeline tests
//!
//! These tests verify:
//! - Per-entity change flags against the previous cycle
//! - Vanished GPUs and workers are reported once
//! - Force refresh and facade fallback mark everything changed
//! - Reactions to the control plane response (version bump, license)

use super::*;
use crate::hypervisor::{test_device, DryRunHypervisor, StaticDeviceSource};
use crate::models::{IsolationMode, LaunchCommand, ResourceLimits};
use crate::observability::StructuredLogger;
use crate::reconciler::ReconcilerConfig;
use crate::sync::{AgentConfigResponse, License, RemoteWorker, StatusResponse};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Records every report and answers with a scripted response
#[derive(Default)]
struct RecordingControlPlane {
    reports: Mutex<Vec<StatusReport>>,
    response: Mutex<StatusResponse>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingControlPlane {
    fn respond_with(&self, response: StatusResponse) {
        *self.response.lock().unwrap() = response;
    }

    fn last_report(&self) -> StatusReport {
        self.reports.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn fetch_config(&self, _agent_id: &str) -> Result<AgentConfigResponse> {
        anyhow::bail!("not used")
    }

    async fn push_status(&self, _agent_id: &str, report: &StatusReport) -> Result<StatusResponse> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("control plane unavailable");
        }
        Ok(self.response.lock().unwrap().clone())
    }
}

struct Harness {
    hv: Arc<DryRunHypervisor>,
    reconciler: Arc<Reconciler>,
    cache: Arc<ConfigCache>,
    control_plane: Arc<RecordingControlPlane>,
    reporter: StatusReporter,
    pulls: mpsc::Receiver<()>,
    connections_dir: tempfile::TempDir,
}

impl Harness {
    async fn new(devices: Vec<Device>) -> Self {
        Self::with_config(devices, StatusConfig::default()).await
    }

    async fn with_config(devices: Vec<Device>, config: StatusConfig) -> Self {
        let hv = Arc::new(DryRunHypervisor::new(Arc::new(StaticDeviceSource::new(devices))));
        hv.start().await.unwrap();
        let reconciler = Arc::new(Reconciler::new(hv.clone(), ReconcilerConfig::default()));
        let cache = Arc::new(ConfigCache::new());
        let control_plane = Arc::new(RecordingControlPlane::default());
        let connections = tempfile::tempdir().unwrap();
        let (trigger, pulls) = PullTrigger::channel();

        let reporter = StatusReporter::new(
            "agent-1",
            config,
            hv.clone(),
            control_plane.clone(),
            reconciler.clone(),
            cache.clone(),
            ConnectionReader::new(Some(connections.path().to_path_buf())),
            trigger,
            StructuredLogger::new("agent-1", "node-1"),
        );

        Self {
            hv,
            reconciler,
            cache,
            control_plane,
            reporter,
            pulls,
            connections_dir: connections,
        }
    }

    /// Declare and launch workers so the facade reports them running
    async fn run_workers(&self, specs: Vec<WorkerSpec>) {
        self.reconciler.set_desired_workers(specs).await;
        self.reconciler.reconcile_once().await.unwrap();
    }

    fn write_connections(&self, worker_id: &str, body: &str) {
        std::fs::write(self.connections_dir.path().join(format!("{}.txt", worker_id)), body).unwrap();
    }
}

fn spec(id: &str, gpus: &[&str]) -> WorkerSpec {
    WorkerSpec {
        worker_id: id.to_string(),
        gpu_ids: gpus.iter().map(|g| g.to_string()).collect(),
        enabled: true,
        limits: ResourceLimits::default(),
        isolation: IsolationMode::Shared,
        command: LaunchCommand::default(),
    }
}

fn actual_worker(id: &str, running: bool) -> WorkerActual {
    WorkerActual {
        worker_id: id.to_string(),
        running,
        pid: running.then_some(100),
        restart_count: 0,
        gpu_ids: Vec::new(),
        command: LaunchCommand::default(),
    }
}

fn worker<'a>(report: &'a StatusReport, id: &str) -> &'a WorkerStatusReport {
    report.workers.iter().find(|w| w.worker_id == id).unwrap()
}

fn gpu<'a>(report: &'a StatusReport, id: &str) -> &'a GpuStatusReport {
    report.gpus.iter().find(|g| g.gpu_id == id).unwrap()
}

fn nothing_changed(report: &StatusReport) -> bool {
    report.gpus.iter().all(|g| !g.gpu_changed)
        && report
            .workers
            .iter()
            .all(|w| !w.worker_changed && !w.connection_changed && !w.gpu_changed)
}

mod derive_tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let mut disabled = spec("w-disabled", &[]);
        disabled.enabled = false;
        let desired = vec![spec("w-run", &[]), spec("w-pending", &["g0"]), disabled];
        let actual = vec![
            actual_worker("w-run", true),
            actual_worker("w-disabled", true),
            actual_worker("w-orphan", false),
        ];

        let observed = derive_worker_statuses(&desired, &actual);
        let by_id: HashMap<&str, WorkerStatus> =
            observed.iter().map(|w| (w.worker_id.as_str(), w.status)).collect();

        assert_eq!(by_id["w-run"], WorkerStatus::Running);
        assert_eq!(by_id["w-disabled"], WorkerStatus::Stopping);
        assert_eq!(by_id["w-orphan"], WorkerStatus::Stopped);
        assert_eq!(by_id["w-pending"], WorkerStatus::Pending);
        assert_eq!(observed.len(), 4);

        let pending = observed.iter().find(|w| w.worker_id == "w-pending").unwrap();
        assert_eq!(pending.gpu_ids, vec!["g0"]);
        assert_eq!(pending.pid, None);
    }

    #[test]
    fn test_disabled_and_absent_is_not_reported() {
        let mut disabled = spec("w1", &[]);
        disabled.enabled = false;
        assert!(derive_worker_statuses(&[disabled], &[]).is_empty());
    }
}

mod change_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_cycle_is_forced_and_second_is_quiet() {
        let h = Harness::new(vec![test_device("GPU-a", 0)]).await;
        h.run_workers(vec![spec("w1", &["GPU-a"])]).await;

        let first = h.reporter.report_once().await.unwrap();
        assert!(first.forced);
        assert!(gpu(&first.report, "GPU-a").gpu_changed);
        let w1 = worker(&first.report, "w1");
        assert_eq!(w1.status, WorkerStatus::Running);
        assert!(w1.worker_changed && w1.connection_changed && w1.gpu_changed);

        let second = h.reporter.report_once().await.unwrap();
        assert!(!second.forced);
        assert!(nothing_changed(&second.report));
        assert_eq!(second.changed_workers(), 0);
        assert_eq!(h.control_plane.reports.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_field_change_sets_only_its_flag() {
        let h = Harness::new(vec![test_device("GPU-a", 0)]).await;
        h.run_workers(vec![spec("w1", &["GPU-a"]), spec("w2", &[])]).await;
        h.reporter.report_once().await.unwrap();

        h.hv.mark_exited("w2");
        let cycle = h.reporter.report_once().await.unwrap();

        let w2 = worker(&cycle.report, "w2");
        assert_eq!(w2.status, WorkerStatus::Stopped);
        assert!(w2.worker_changed);
        assert!(!w2.connection_changed);
        assert!(!worker(&cycle.report, "w1").worker_changed);
        assert_eq!(cycle.changed_workers(), 1);
    }

    #[tokio::test]
    async fn test_connection_change_is_detected() {
        let h = Harness::new(Vec::new()).await;
        h.run_workers(vec![spec("w1", &[])]).await;
        h.reporter.report_once().await.unwrap();

        h.write_connections("w1", "10.0.0.5,51000,4242\nnot-an-ip\n");
        let cycle = h.reporter.report_once().await.unwrap();
        let w1 = worker(&cycle.report, "w1");
        assert!(w1.connection_changed);
        assert!(!w1.worker_changed);
        assert_eq!(w1.connections.len(), 1);
        assert_eq!(w1.connections[0].client_pid, Some(4242));

        // Same contents in a different order are not a change
        h.write_connections("w1", "not-an-ip\n10.0.0.5,51000,4242\n");
        let cycle = h.reporter.report_once().await.unwrap();
        assert!(!worker(&cycle.report, "w1").connection_changed);
    }

    #[tokio::test]
    async fn test_vanished_worker_reported_once() {
        let h = Harness::new(Vec::new()).await;
        h.run_workers(vec![spec("w1", &[])]).await;
        h.reporter.report_once().await.unwrap();

        h.run_workers(Vec::new()).await;
        let cycle = h.reporter.report_once().await.unwrap();
        let w1 = worker(&cycle.report, "w1");
        assert_eq!(w1.status, WorkerStatus::Stopped);
        assert!(w1.worker_changed && w1.connection_changed);

        let cycle = h.reporter.report_once().await.unwrap();
        assert!(cycle.report.workers.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_gpu_reported_once() {
        let h = Harness::new(vec![test_device("GPU-a", 0), test_device("GPU-b", 1)]).await;
        h.run_workers(vec![spec("w1", &["GPU-b"]), spec("w2", &["GPU-a"])]).await;
        h.reporter.report_once().await.unwrap();

        // Seed a prior cycle that also saw GPU-z
        let mut snapshots = h.reporter.snapshots.write().await;
        let mut gpus = HashMap::new();
        gpus.insert("GPU-a".to_string(), GpuSnapshot::from(&test_device("GPU-a", 0)));
        let mut retired = test_device("GPU-z", 9);
        retired.model = "retired".to_string();
        gpus.insert("GPU-z".to_string(), GpuSnapshot::from(&retired));
        gpus.insert("GPU-b".to_string(), GpuSnapshot::from(&test_device("GPU-b", 1)));
        let workers = HashMap::from([
            ("w1".to_string(), WorkerSnapshot::new(WorkerStatus::Running, None, 0, &["GPU-b".to_string()])),
            ("w2".to_string(), WorkerSnapshot::new(WorkerStatus::Running, None, 0, &["GPU-a".to_string()])),
        ]);
        let connections = HashMap::from([
            ("w1".to_string(), ConnectionSet::new()),
            ("w2".to_string(), ConnectionSet::new()),
        ]);
        snapshots.replace(gpus, workers, connections);
        drop(snapshots);

        let cycle = h.reporter.report_once().await.unwrap();
        let gone = gpu(&cycle.report, "GPU-z");
        assert!(!gone.present);
        assert!(gone.gpu_changed);
        assert_eq!(gone.model, "retired");
        assert!(!gpu(&cycle.report, "GPU-a").gpu_changed);
        assert!(!worker(&cycle.report, "w2").gpu_changed);

        let cycle = h.reporter.report_once().await.unwrap();
        assert!(cycle.report.gpus.iter().all(|g| g.present));
    }

    #[tokio::test]
    async fn test_changed_gpu_marks_its_workers() {
        let h = Harness::new(vec![test_device("GPU-a", 0)]).await;
        h.run_workers(vec![spec("w1", &["GPU-a"]), spec("w2", &[])]).await;
        h.reporter.report_once().await.unwrap();

        // Pretend the previous cycle saw an older driver
        {
            let mut snapshots = h.reporter.snapshots.write().await;
            let mut old = test_device("GPU-a", 0);
            old.driver_version = "525.0".to_string();
            let workers = HashMap::from([
                ("w1".to_string(), WorkerSnapshot::new(WorkerStatus::Running, None, 0, &["GPU-a".to_string()])),
                ("w2".to_string(), WorkerSnapshot::new(WorkerStatus::Running, None, 0, &[])),
            ]);
            let connections = HashMap::from([
                ("w1".to_string(), ConnectionSet::new()),
                ("w2".to_string(), ConnectionSet::new()),
            ]);
            snapshots.replace(
                HashMap::from([("GPU-a".to_string(), GpuSnapshot::from(&old))]),
                workers,
                connections,
            );
        }

        let cycle = h.reporter.report_once().await.unwrap();
        assert!(gpu(&cycle.report, "GPU-a").gpu_changed);
        assert!(worker(&cycle.report, "w1").gpu_changed);
        assert!(!worker(&cycle.report, "w1").worker_changed);
        assert!(!worker(&cycle.report, "w2").gpu_changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_marks_everything() {
        let config = StatusConfig {
            interval: Duration::from_secs(60),
            force_refresh_interval: Duration::from_secs(600),
        };
        let h = Harness::with_config(vec![test_device("GPU-a", 0)], config).await;
        h.run_workers(vec![spec("w1", &["GPU-a"])]).await;

        assert!(h.reporter.report_once().await.unwrap().forced);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(nothing_changed(&h.reporter.report_once().await.unwrap().report));

        tokio::time::advance(Duration::from_secs(301)).await;
        let cycle = h.reporter.report_once().await.unwrap();
        assert!(cycle.forced);
        assert!(gpu(&cycle.report, "GPU-a").gpu_changed);
        assert!(worker(&cycle.report, "w1").worker_changed);

        let summary = h.reporter.snapshot_summary().await;
        assert_eq!(summary.gpus, 1);
        assert_eq!(summary.workers, 1);
        assert_eq!(summary.seconds_since_force_refresh, Some(0));
    }

    #[tokio::test]
    async fn test_fallback_reports_cached_workers() {
        let h = Harness::new(vec![test_device("GPU-a", 0)]).await;
        let disabled = RemoteWorker {
            worker_id: "w2".to_string(),
            gpu_ids: Vec::new(),
            enabled: false,
            vram_mb: 0,
            compute_percent: 0,
            isolation: String::new(),
            listen_port: None,
            args: Vec::new(),
            env: HashMap::new(),
        };
        let enabled = RemoteWorker {
            worker_id: "w1".to_string(),
            gpu_ids: vec!["GPU-a".to_string()],
            enabled: true,
            ..disabled.clone()
        };
        h.cache
            .apply(&AgentConfigResponse {
                version: 2,
                workers: vec![enabled, disabled],
                license: None,
            })
            .await;
        h.cache.set_gpus(vec![test_device("GPU-a", 0)]).await;

        h.reporter.report_once().await.unwrap();
        h.hv.stop().await.unwrap();

        let cycle = h.reporter.report_once().await.unwrap();
        assert!(cycle.fallback);
        assert!(!cycle.forced);
        assert_eq!(worker(&cycle.report, "w1").status, WorkerStatus::Pending);
        assert_eq!(worker(&cycle.report, "w2").status, WorkerStatus::Stopped);
        assert!(gpu(&cycle.report, "GPU-a").gpu_changed);
        assert!(cycle.report.workers.iter().all(|w| w.worker_changed && w.connection_changed));
    }
}

mod response_tests {
    use super::*;

    #[tokio::test]
    async fn test_newer_version_triggers_pull() {
        let mut h = Harness::new(Vec::new()).await;
        h.cache
            .apply(&AgentConfigResponse {
                version: 4,
                ..Default::default()
            })
            .await;

        h.control_plane.respond_with(StatusResponse {
            config_version: 4,
            license: None,
        });
        h.reporter.report_once().await.unwrap();
        assert!(h.pulls.try_recv().is_err());

        h.control_plane.respond_with(StatusResponse {
            config_version: 5,
            license: None,
        });
        h.reporter.report_once().await.unwrap();
        assert!(h.pulls.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_any_version_triggers_pull_before_first_config() {
        let mut h = Harness::new(Vec::new()).await;

        h.reporter.report_once().await.unwrap();
        assert!(h.pulls.try_recv().is_err(), "version 0 is not an offer");

        h.control_plane.respond_with(StatusResponse {
            config_version: 1,
            license: None,
        });
        h.reporter.report_once().await.unwrap();
        assert!(h.pulls.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_license_stored_without_version_bump() {
        let mut h = Harness::new(Vec::new()).await;
        h.cache
            .apply(&AgentConfigResponse {
                version: 3,
                ..Default::default()
            })
            .await;
        let license = License {
            signature: "sig".to_string(),
            plain: "tenant|pro|1767225600000".to_string(),
        };
        h.control_plane.respond_with(StatusResponse {
            config_version: 3,
            license: Some(license.clone()),
        });

        h.reporter.report_once().await.unwrap();
        assert_eq!(h.cache.license().await, Some(license));
        assert!(h.pulls.try_recv().is_err());

        // The next report carries the parsed expiry
        h.reporter.report_once().await.unwrap();
        assert_eq!(
            h.control_plane.last_report().license_expiration,
            Some(1_767_225_600_000)
        );
    }

    #[tokio::test]
    async fn test_failed_send_still_advances_snapshots() {
        let h = Harness::new(vec![test_device("GPU-a", 0)]).await;
        h.run_workers(vec![spec("w1", &["GPU-a"])]).await;
        h.control_plane
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(h.reporter.report_once().await.is_err());

        h.control_plane
            .fail
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let cycle = h.reporter.report_once().await.unwrap();
        assert!(nothing_changed(&cycle.report));
        assert_eq!(h.control_plane.reports.lock().unwrap().len(), 2);
    }
}
