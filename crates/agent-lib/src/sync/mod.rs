//! Synchronization with the fleet control plane
//!
//! This module provides:
//! - REST client and wire types for config pull and status push
//! - In-memory config cache and license expiry parsing
//! - The config pull pipeline feeding the reconciler
//! - The server-push event listener with debounce and reconnect backoff

mod cache;
mod client;
mod config_pull;
mod events;
mod license;

#[cfg(test)]
mod tests;

pub use cache::{CachedConfig, ConfigCache};
pub use client::{
    AgentConfigResponse, ControlPlane, ControlPlaneConfig, GpuStatusReport, HttpControlPlane,
    License, RemoteWorker, StatusReport, StatusResponse, WorkerStatusReport,
};
pub use config_pull::{
    limit_env, to_worker_spec, visibility_env, ConfigPuller, LaunchTemplate, PullOutcome,
    PullTrigger, COMPUTE_LIMIT_ENV, CONNECTIONS_DIR_ENV, MEMORY_LIMIT_ENV, WORKER_ID_ENV,
};
pub use events::{
    parse_restart_ids, Backoff, EventListener, EventListenerConfig, EventParser, ListenerState,
    ServerEvent, RESTART_EVENT, TOPICS_HEADER,
};
pub use license::parse_expiry_ms;
