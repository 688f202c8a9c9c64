//! Core data models for the fleet agent

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

/// How strictly a worker's GPU access is partitioned from other workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Workers share the device with no limits
    #[default]
    Shared,
    /// Limits are advisory
    Soft,
    /// Limits are enforced by the worker runtime
    Partitioned,
}

impl IsolationMode {
    /// Map a control-plane string onto an isolation mode.
    ///
    /// `hard` is accepted as an alias for `partitioned`; anything unknown is `shared`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "soft" => IsolationMode::Soft,
            "partitioned" | "hard" => IsolationMode::Partitioned,
            _ => IsolationMode::Shared,
        }
    }

    /// Whether hard resource limits must be exported to the worker
    pub fn enforces_limits(&self) -> bool {
        matches!(self, IsolationMode::Partitioned)
    }
}

/// Resource limits applied to one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// VRAM limit in megabytes, 0 means unlimited
    pub vram_mb: u64,
    /// Compute share in percent, 0 means unlimited
    pub compute_percent: u32,
}

/// How a worker binary is launched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Desired state of one worker, produced by the config pull pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker_id: String,
    pub gpu_ids: Vec<String>,
    pub enabled: bool,
    pub limits: ResourceLimits,
    pub isolation: IsolationMode,
    pub command: LaunchCommand,
}

/// Observed state of one worker, owned by the hypervisor facade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerActual {
    pub worker_id: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub gpu_ids: Vec<String>,
    pub command: LaunchCommand,
}

/// GPU vendor, which decides the device-visibility environment contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    #[default]
    Nvidia,
    Amd,
    Other,
}

impl GpuVendor {
    pub fn parse(value: &str) -> Self {
        let lower = value.to_ascii_lowercase();
        if lower.contains("nvidia") {
            GpuVendor::Nvidia
        } else if lower.contains("amd") || lower.contains("rocm") || lower.contains("advanced micro") {
            GpuVendor::Amd
        } else {
            GpuVendor::Other
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "nvidia"),
            GpuVendor::Amd => write!(f, "amd"),
            GpuVendor::Other => write!(f, "other"),
        }
    }
}

/// A GPU visible on this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier (UUID where the vendor exposes one)
    pub gpu_id: String,
    /// Ordinal used by the vendor runtime for visibility lists
    pub index: u32,
    #[serde(default)]
    pub vendor: GpuVendor,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub vram_mb: u64,
    #[serde(default)]
    pub driver_version: String,
    /// CUDA / ROCm runtime version
    #[serde(default)]
    pub runtime_version: String,
}

/// Point-in-time device utilisation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub utilization_percent: f32,
    pub memory_used_mb: u64,
    pub temperature_c: Option<u32>,
    pub power_watts: Option<f32>,
}

/// Worker status as reported upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum WorkerStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    /// Total mapping from any external string; unknown values collapse to `Pending`
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => WorkerStatus::Running,
            "stopping" => WorkerStatus::Stopping,
            "stopped" => WorkerStatus::Stopped,
            _ => WorkerStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl From<String> for WorkerStatus {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client connection reported by a worker through the side-channel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_pid: Option<u32>,
}

/// Order-insensitive set of connections for one worker
pub type ConnectionSet = BTreeSet<ConnectionRecord>;
