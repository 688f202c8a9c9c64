//! NVIDIA device discovery through NVML
//!
//! `nvml-wrapper` loads libnvidia-ml at runtime; every foreign call in the
//! crate goes through this module.

use super::devices::DeviceSource;
use crate::models::{Device, DeviceMetrics, GpuVendor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use std::collections::HashMap;
use tracing::{debug, info};

/// Device source backed by the NVIDIA management library
pub struct NvmlDeviceSource {
    nvml: Nvml,
}

impl NvmlDeviceSource {
    /// Load the library; fails on hosts without an NVIDIA driver
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().context("Failed to initialise NVML")?;
        info!("NVML initialised");
        Ok(Self { nvml })
    }

    fn runtime_version(&self) -> String {
        match self.nvml.sys_cuda_driver_version() {
            Ok(v) => format!(
                "{}.{}",
                nvml_wrapper::cuda_driver_version_major(v),
                nvml_wrapper::cuda_driver_version_minor(v)
            ),
            Err(e) => {
                debug!(error = %e, "CUDA driver version unavailable");
                String::new()
            }
        }
    }
}

#[async_trait]
impl DeviceSource for NvmlDeviceSource {
    async fn discover(&self) -> Result<Vec<Device>> {
        let count = self.nvml.device_count().context("NVML device count")?;
        let driver_version = self.nvml.sys_driver_version().unwrap_or_default();
        let runtime_version = self.runtime_version();

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .with_context(|| format!("NVML device {}", index))?;
            let gpu_id = device.uuid().context("NVML device uuid")?;
            let vram_mb = device
                .memory_info()
                .map(|m| m.total / (1024 * 1024))
                .unwrap_or(0);

            devices.push(Device {
                gpu_id,
                index,
                vendor: GpuVendor::Nvidia,
                model: device.name().unwrap_or_default(),
                vram_mb,
                driver_version: driver_version.clone(),
                runtime_version: runtime_version.clone(),
            });
        }

        Ok(devices)
    }

    async fn metrics(&self) -> Result<HashMap<String, DeviceMetrics>> {
        let count = self.nvml.device_count().context("NVML device count")?;
        let mut out = HashMap::new();

        for index in 0..count {
            let Ok(device) = self.nvml.device_by_index(index) else {
                continue;
            };
            let Ok(gpu_id) = device.uuid() else {
                continue;
            };

            out.insert(
                gpu_id,
                DeviceMetrics {
                    utilization_percent: device
                        .utilization_rates()
                        .map(|u| u.gpu as f32)
                        .unwrap_or(0.0),
                    memory_used_mb: device
                        .memory_info()
                        .map(|m| m.used / (1024 * 1024))
                        .unwrap_or(0),
                    temperature_c: device.temperature(TemperatureSensor::Gpu).ok(),
                    power_watts: device.power_usage().ok().map(|mw| mw as f32 / 1000.0),
                },
            );
        }

        Ok(out)
    }
}
