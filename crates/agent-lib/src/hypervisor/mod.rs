//! Hypervisor facade
//!
//! The narrow capability set the reconciler and status pipeline drive. The
//! facade owns GPU allocation and OS supervision of worker processes; callers
//! never cache its worker list across passes.

mod devices;
mod dry_run;
mod local;
#[cfg(feature = "nvml")]
mod nvml;

pub use devices::{DeviceSource, StaticDeviceSource};
#[cfg(test)]
pub(crate) use devices::test_device;
pub use dry_run::{DryRunHypervisor, HypervisorCall};
pub use local::{LocalHypervisorConfig, LocalProcessHypervisor};
#[cfg(feature = "nvml")]
pub use nvml::NvmlDeviceSource;

use crate::error::HypervisorResult;
use crate::models::{Device, DeviceMetrics, WorkerActual, WorkerSpec};
use std::collections::HashMap;

pub use async_trait::async_trait;

/// Capability set every hypervisor backend implements
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Initialise the backend; must succeed before any other call
    async fn start(&self) -> HypervisorResult<()>;

    /// Tear the backend down, stopping any worker it still supervises
    async fn stop(&self) -> HypervisorResult<()>;

    fn is_started(&self) -> bool;

    async fn list_devices(&self) -> HypervisorResult<Vec<Device>>;

    async fn list_workers(&self) -> HypervisorResult<Vec<WorkerActual>>;

    /// Allocate devices and launch a worker
    async fn start_worker(&self, spec: &WorkerSpec) -> HypervisorResult<()>;

    async fn stop_worker(&self, worker_id: &str) -> HypervisorResult<()>;

    /// Replace the worker's environment without touching the running process.
    ///
    /// New values apply from the next launch of the worker.
    async fn update_worker_env(
        &self,
        worker_id: &str,
        env: &HashMap<String, String>,
    ) -> HypervisorResult<()>;

    async fn device_metrics(&self) -> HypervisorResult<HashMap<String, DeviceMetrics>>;

    /// Stop relaunching exited workers ahead of shutdown
    fn suspend_recovery(&self) {}
}
