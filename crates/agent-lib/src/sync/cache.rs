//! In-memory cache of the last applied control-plane config
//!
//! Also the fallback source for the status pipeline when the hypervisor
//! facade is unavailable.

use super::client::{AgentConfigResponse, License, RemoteWorker};
use crate::models::Device;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct CachedConfig {
    /// `None` until a config has been applied
    pub version: Option<u64>,
    pub workers: Vec<RemoteWorker>,
    pub license: Option<License>,
    /// Last GPU list observed from the facade
    pub gpus: Vec<Device>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct ConfigCache {
    inner: RwLock<CachedConfig>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> CachedConfig {
        self.inner.read().await.clone()
    }

    pub async fn version(&self) -> Option<u64> {
        self.inner.read().await.version
    }

    /// True when `version` should replace what is cached
    pub async fn is_newer(&self, version: u64) -> bool {
        match self.inner.read().await.version {
            None => true,
            Some(current) => version > current,
        }
    }

    pub async fn workers(&self) -> Vec<RemoteWorker> {
        self.inner.read().await.workers.clone()
    }

    pub async fn license(&self) -> Option<License> {
        self.inner.read().await.license.clone()
    }

    pub async fn gpus(&self) -> Vec<Device> {
        self.inner.read().await.gpus.clone()
    }

    /// Store a pulled config. The license is only replaced when one is present.
    pub async fn apply(&self, config: &AgentConfigResponse) {
        let mut inner = self.inner.write().await;
        inner.version = Some(config.version);
        inner.workers = config.workers.clone();
        if let Some(license) = &config.license {
            inner.license = Some(license.clone());
        }
        inner.applied_at = Some(Utc::now());
    }

    /// Replace the license without touching the version. Returns whether it changed.
    pub async fn set_license(&self, license: License) -> bool {
        let mut inner = self.inner.write().await;
        if inner.license.as_ref() == Some(&license) {
            return false;
        }
        inner.license = Some(license);
        true
    }

    pub async fn set_gpus(&self, gpus: Vec<Device>) {
        self.inner.write().await.gpus = gpus;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn license(sig: &str) -> License {
        License {
            signature: sig.to_string(),
            plain: "t|p|1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_version_gating() {
        let cache = ConfigCache::new();
        assert!(cache.is_newer(0).await);

        cache
            .apply(&AgentConfigResponse {
                version: 5,
                ..Default::default()
            })
            .await;
        assert_eq!(cache.version().await, Some(5));
        assert!(!cache.is_newer(5).await);
        assert!(!cache.is_newer(4).await);
        assert!(cache.is_newer(6).await);
    }

    #[tokio::test]
    async fn test_license_update_keeps_version() {
        let cache = ConfigCache::new();
        cache
            .apply(&AgentConfigResponse {
                version: 2,
                license: Some(license("a")),
                ..Default::default()
            })
            .await;

        assert!(!cache.set_license(license("a")).await);
        assert!(cache.set_license(license("b")).await);
        assert_eq!(cache.license().await.unwrap().signature, "b");
        assert_eq!(cache.version().await, Some(2));
    }

    #[tokio::test]
    async fn test_apply_without_license_keeps_previous() {
        let cache = ConfigCache::new();
        cache.set_license(license("a")).await;
        cache
            .apply(&AgentConfigResponse {
                version: 1,
                ..Default::default()
            })
            .await;
        assert_eq!(cache.license().await.unwrap().signature, "a");
    }
}
