//! Agent configuration

use anyhow::{bail, Context, Result};
use fleet_agent_lib::{
    models::Device,
    reconciler::ReconcilerConfig,
    status::StatusConfig,
    sync::{ControlPlaneConfig, EventListenerConfig, LaunchTemplate},
    AgentSettings,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional config file
pub const CONFIG_FILE_ENV: &str = "FLEET_AGENT_CONFIG";

const ENV_PREFIX: &str = "FLEET_AGENT";

/// Which hypervisor facade drives the workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Worker binaries run as supervised local processes
    #[default]
    Local,
    /// Launches are only recorded
    DryRun,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::DryRun => "dry-run",
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity registered with the control plane
    #[serde(default)]
    pub agent_id: String,

    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Control plane base URL
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Event stream URL; `{api_endpoint}/events` when unset
    #[serde(default)]
    pub events_endpoint: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub worker_binary: Option<PathBuf>,

    #[serde(default)]
    pub worker_args: Vec<String>,

    #[serde(default)]
    pub worker_workdir: Option<PathBuf>,

    /// Directory workers write their connection files into
    #[serde(default)]
    pub connections_dir: Option<PathBuf>,

    /// Static device list for hosts without NVML
    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    #[serde(default = "default_config_pull_interval")]
    pub config_pull_interval_secs: u64,

    #[serde(default = "default_force_refresh_interval")]
    pub force_refresh_interval_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_restart_settle")]
    pub restart_settle_ms: u64,

    #[serde(default = "default_event_debounce")]
    pub event_debounce_ms: u64,

    #[serde(default = "default_event_min_backoff")]
    pub event_min_backoff_ms: u64,

    #[serde(default = "default_event_max_backoff")]
    pub event_max_backoff_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_endpoint() -> String {
    "http://localhost:8000/api/v1".to_string()
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_status_interval() -> u64 {
    60
}

fn default_config_pull_interval() -> u64 {
    300
}

fn default_force_refresh_interval() -> u64 {
    6 * 3600
}

fn default_shutdown_timeout() -> u64 {
    20
}

fn default_restart_settle() -> u64 {
    1000
}

fn default_event_debounce() -> u64 {
    2000
}

fn default_event_min_backoff() -> u64 {
    1000
}

fn default_event_max_backoff() -> u64 {
    60
}

impl AgentConfig {
    /// Load from the optional config file, overridden by `FLEET_AGENT_*`
    /// environment variables
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("worker_args"),
        );

        let config: Self = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a single file, without the environment layer
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("Failed to read {}", path.display()))?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the agent cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            bail!("agent_id is required");
        }
        if self.backend == Backend::Local {
            let Some(binary) = &self.worker_binary else {
                bail!("worker_binary is required for the local backend");
            };
            if !binary.is_file() {
                bail!("worker binary {} does not exist", binary.display());
            }
        }
        for (key, value) in [
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("status_interval_secs", self.status_interval_secs),
            ("config_pull_interval_secs", self.config_pull_interval_secs),
            ("force_refresh_interval_secs", self.force_refresh_interval_secs),
            ("event_min_backoff_ms", self.event_min_backoff_ms),
        ] {
            if value == 0 {
                bail!("{} must be positive", key);
            }
        }
        Ok(())
    }

    pub fn events_endpoint(&self) -> String {
        self.events_endpoint
            .clone()
            .unwrap_or_else(|| format!("{}/events", self.api_endpoint.trim_end_matches('/')))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn control_plane(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            endpoint: self.api_endpoint.clone(),
            token: self.api_token.clone(),
            ..ControlPlaneConfig::default()
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings::new(self.agent_id.clone())
            .with_node_name(self.node_name.clone())
            .with_backend(self.backend.as_str())
            .with_reconciler(ReconcilerConfig {
                interval: Duration::from_secs(self.reconcile_interval_secs),
                restart_settle_delay: Duration::from_millis(self.restart_settle_ms),
            })
            .with_status(StatusConfig {
                interval: Duration::from_secs(self.status_interval_secs),
                force_refresh_interval: Duration::from_secs(self.force_refresh_interval_secs),
            })
            .with_events(EventListenerConfig {
                endpoint: self.events_endpoint(),
                token: self.api_token.clone(),
                debounce: Duration::from_millis(self.event_debounce_ms),
                min_backoff: Duration::from_millis(self.event_min_backoff_ms),
                max_backoff: Duration::from_secs(self.event_max_backoff_secs),
                ..EventListenerConfig::default()
            })
            .with_launch(LaunchTemplate {
                executable: self.worker_binary.clone().unwrap_or_default(),
                base_args: self.worker_args.clone(),
                working_dir: self.worker_workdir.clone(),
                connections_dir: self.connections_dir.clone(),
            })
            .with_config_pull_interval(Duration::from_secs(self.config_pull_interval_secs))
            .with_shutdown_timeout(self.shutdown_timeout())
    }
}
