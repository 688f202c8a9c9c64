//! GPU device discovery

use crate::models::{Device, DeviceMetrics};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Source of the host's GPU inventory
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Enumerate the devices visible on this host
    async fn discover(&self) -> Result<Vec<Device>>;

    /// Current utilisation per device id; best effort
    async fn metrics(&self) -> Result<HashMap<String, DeviceMetrics>> {
        Ok(HashMap::new())
    }
}

/// Devices declared in configuration, for hosts without a vendor library
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceSource {
    devices: Vec<Device>,
}

impl StaticDeviceSource {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceSource for StaticDeviceSource {
    async fn discover(&self) -> Result<Vec<Device>> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_device(gpu_id: &str, index: u32) -> Device {
    Device {
        gpu_id: gpu_id.to_string(),
        index,
        vendor: crate::models::GpuVendor::Nvidia,
        model: "NVIDIA A100-SXM4-80GB".to_string(),
        vram_mb: 81920,
        driver_version: "535.154.05".to_string(),
        runtime_version: "12.2".to_string(),
    }
}
