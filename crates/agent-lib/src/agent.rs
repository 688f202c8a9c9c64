//! Agent composition root
//!
//! Wires the hypervisor facade, reconciler, config pull loop, status loop and
//! event listener together, and owns the ordered startup and shutdown.

use crate::health::{components, HealthRegistry};
use crate::hypervisor::Hypervisor;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::process::{LifecycleConfig, ProcessLifecycleManager, TerminationReport};
use crate::reconciler::{ReconcileResult, Reconciler, ReconcilerConfig, ReconcilerStatus};
use crate::status::{ConnectionReader, SnapshotSummary, StatusConfig, StatusReporter};
use crate::sync::{
    ConfigCache, ConfigPuller, ControlPlane, EventListener, EventListenerConfig, LaunchTemplate,
    ListenerState, PullOutcome, PullTrigger,
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything the agent needs besides its facade and control plane
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_id: String,
    pub node_name: String,
    /// Backend label for the startup log
    pub backend: String,
    pub reconciler: ReconcilerConfig,
    pub status: StatusConfig,
    pub events: EventListenerConfig,
    pub launch: LaunchTemplate,
    pub config_pull_interval: Duration,
    /// Bound on terminating workers at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            node_name: "unknown".to_string(),
            backend: "local".to_string(),
            reconciler: ReconcilerConfig::default(),
            status: StatusConfig::default(),
            events: EventListenerConfig::default(),
            launch: LaunchTemplate::default(),
            config_pull_interval: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(20),
        }
    }
}

impl AgentSettings {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_status(mut self, status: StatusConfig) -> Self {
        self.status = status;
        self
    }

    pub fn with_events(mut self, events: EventListenerConfig) -> Self {
        self.events = events;
        self
    }

    pub fn with_launch(mut self, launch: LaunchTemplate) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_config_pull_interval(mut self, interval: Duration) -> Self {
        self.config_pull_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Point-in-time view served on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub running: bool,
    pub reconciler: ReconcilerStatus,
    pub pending_restarts: usize,
    pub config_version: Option<u64>,
    pub license_expiration: Option<i64>,
    pub event_stream: ListenerState,
    pub snapshots: SnapshotSummary,
}

struct RunningAgent {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Agent {
    settings: AgentSettings,
    hypervisor: Arc<dyn Hypervisor>,
    reconciler: Arc<Reconciler>,
    cache: Arc<ConfigCache>,
    puller: Arc<ConfigPuller>,
    reporter: Arc<StatusReporter>,
    listener: Arc<EventListener>,
    lifecycle: ProcessLifecycleManager,
    health: HealthRegistry,
    logger: StructuredLogger,
    pull_rx: Mutex<Option<mpsc::Receiver<()>>>,
    running: Mutex<Option<RunningAgent>>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        hypervisor: Arc<dyn Hypervisor>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Result<Self> {
        if settings.agent_id.is_empty() {
            bail!("agent_id must be set");
        }
        for (name, period) in [
            ("reconcile interval", settings.reconciler.interval),
            ("status interval", settings.status.interval),
            ("config pull interval", settings.config_pull_interval),
        ] {
            if period.is_zero() {
                bail!("{} must be positive", name);
            }
        }

        let health = HealthRegistry::new();
        let metrics = AgentMetrics::new();
        let logger = StructuredLogger::new(&settings.agent_id, &settings.node_name);

        let reconciler = {
            let health = health.clone();
            let logger = logger.clone();
            let on_result = move |result: &ReconcileResult, elapsed: Duration| {
                metrics.record_reconcile(result, elapsed.as_secs_f64());
                logger.log_reconcile(result);
                let health = health.clone();
                let failed = result.failed;
                tokio::spawn(async move {
                    if failed == 0 {
                        health.set_healthy(components::RECONCILER).await;
                    } else {
                        health
                            .set_degraded(
                                components::RECONCILER,
                                format!("{} worker operations failed", failed),
                            )
                            .await;
                    }
                });
            };
            Arc::new(
                Reconciler::new(hypervisor.clone(), settings.reconciler.clone())
                    .with_callback(Arc::new(on_result)),
            )
        };

        let cache = Arc::new(ConfigCache::new());
        let (pull_trigger, pull_rx) = PullTrigger::channel();

        let puller = ConfigPuller::new(
            settings.agent_id.clone(),
            control_plane.clone(),
            hypervisor.clone(),
            reconciler.clone(),
            cache.clone(),
            settings.launch.clone(),
            settings.config_pull_interval,
            logger.clone(),
        )
        .with_health(health.clone());

        let reporter = StatusReporter::new(
            settings.agent_id.clone(),
            settings.status.clone(),
            hypervisor.clone(),
            control_plane,
            reconciler.clone(),
            cache.clone(),
            ConnectionReader::new(settings.launch.connections_dir.clone()),
            pull_trigger.clone(),
            logger.clone(),
        )
        .with_health(health.clone());

        let listener = EventListener::new(
            settings.agent_id.clone(),
            settings.events.clone(),
            reconciler.clone(),
            pull_trigger,
            logger.clone(),
        )?
        .with_health(health.clone());

        let lifecycle = ProcessLifecycleManager::new(LifecycleConfig {
            graceful_timeout: settings.shutdown_timeout,
            ..LifecycleConfig::default()
        });

        Ok(Self {
            settings,
            hypervisor,
            reconciler,
            cache,
            puller: Arc::new(puller),
            reporter: Arc::new(reporter),
            listener: Arc::new(listener),
            lifecycle,
            health,
            logger,
            pull_rx: Mutex::new(Some(pull_rx)),
            running: Mutex::new(None),
        })
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bring the agent up. Only a facade failure is fatal.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let mut pull_rx = self.pull_rx.lock().await;
        if pull_rx.is_none() {
            bail!("agent has already been stopped and cannot restart");
        }

        self.health.register_all().await;
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &self.settings.backend);

        if let Err(e) = self.hypervisor.start().await {
            self.health
                .set_unhealthy(components::HYPERVISOR, e.to_string())
                .await;
            return Err(e).context("Failed to start hypervisor");
        }
        self.health.set_healthy(components::HYPERVISOR).await;

        let cancel = CancellationToken::new();
        self.reconciler.start(&cancel).await;
        self.health.set_healthy(components::RECONCILER).await;

        match self.puller.pull().await {
            Ok(PullOutcome::Applied { version, workers }) => {
                info!(version = version, workers = workers, "Initial config applied");
                self.health.set_healthy(components::CONFIG_PULLER).await;
            }
            Ok(PullOutcome::Unchanged { version }) => {
                info!(version = version, "Initial config carries no newer version");
                self.health.set_healthy(components::CONFIG_PULLER).await;
            }
            Err(e) => {
                warn!(error = %e, "Initial config pull failed; continuing with the periodic loop");
                self.health
                    .set_degraded(components::CONFIG_PULLER, e.to_string())
                    .await;
            }
        }

        let pull_rx = pull_rx
            .take()
            .ok_or_else(|| anyhow!("config pull trigger already consumed"))?;
        let tasks = vec![
            tokio::spawn(self.puller.clone().run(pull_rx, cancel.clone())),
            tokio::spawn(self.reporter.clone().run(cancel.clone())),
            tokio::spawn(self.listener.clone().run(cancel.clone())),
        ];
        *running = Some(RunningAgent { cancel, tasks });

        self.health.set_ready(true).await;
        info!(agent_id = %self.settings.agent_id, "Agent started");
        Ok(())
    }

    /// Ordered shutdown. Safe before `start` and when called twice.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        self.health.set_ready(false).await;
        self.logger.log_shutdown("stop requested");

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Agent task ended abnormally");
            }
        }

        self.reconciler.stop().await;
        self.hypervisor.suspend_recovery();

        let report = self.terminate_workers().await;
        if !report.is_clean() {
            warn!(survivors = ?report.survivors, "Worker processes survived shutdown");
        }

        self.hypervisor
            .stop()
            .await
            .context("Failed to stop hypervisor")?;
        info!(agent_id = %self.settings.agent_id, "Agent stopped");
        Ok(())
    }

    /// Terminate every running worker pid, bounded by the shutdown timeout
    async fn terminate_workers(&self) -> TerminationReport {
        let pids: Vec<u32> = match self.hypervisor.list_workers().await {
            Ok(workers) => workers
                .iter()
                .filter(|w| w.running)
                .filter_map(|w| w.pid)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Cannot list workers for shutdown");
                return TerminationReport::default();
            }
        };
        if pids.is_empty() {
            return TerminationReport::default();
        }

        info!(workers = pids.len(), "Terminating worker processes");
        let bound = self.settings.shutdown_timeout + self.lifecycle.config().kill_timeout;
        match tokio::time::timeout(bound, self.lifecycle.terminate_all(&pids)).await {
            Ok(report) => report,
            Err(_) => {
                warn!(timeout_secs = bound.as_secs(), "Worker termination timed out");
                TerminationReport {
                    survivors: pids,
                    ..TerminationReport::default()
                }
            }
        }
    }

    pub async fn status(&self) -> AgentStatus {
        let cached = self.cache.snapshot().await;
        AgentStatus {
            agent_id: self.settings.agent_id.clone(),
            running: self.is_running().await,
            reconciler: self.reconciler.get_status().await,
            pending_restarts: self.reconciler.pending_restarts().await,
            config_version: cached.version,
            license_expiration: cached.license.and_then(|l| l.expiration_ms()),
            event_stream: self.listener.state(),
            snapshots: self.reporter.snapshot_summary().await,
        }
    }
}
