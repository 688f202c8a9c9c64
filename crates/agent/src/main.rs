//! Fleet agent - GPU worker supervisor
//!
//! This binary runs on each GPU node, keeping the declared worker processes
//! running and reporting their state to the fleet control plane.

use fleet_agent_lib::{
    hypervisor::{
        DeviceSource, DryRunHypervisor, Hypervisor, LocalHypervisorConfig, LocalProcessHypervisor,
        StaticDeviceSource,
    },
    observability::AgentMetrics,
    process::LifecycleConfig,
    sync::HttpControlPlane,
    Agent,
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{AgentConfig, Backend};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-agent");

    let config = AgentConfig::load()?;
    info!(
        agent_id = %config.agent_id,
        node_name = %config.node_name,
        backend = config.backend.as_str(),
        api_endpoint = %config.api_endpoint,
        "Agent configured"
    );

    let devices = device_source(&config);
    let hypervisor: Arc<dyn Hypervisor> = match config.backend {
        Backend::Local => Arc::new(LocalProcessHypervisor::new(
            LocalHypervisorConfig {
                lifecycle: LifecycleConfig {
                    graceful_timeout: config.shutdown_timeout(),
                    ..LifecycleConfig::default()
                },
                ..LocalHypervisorConfig::default()
            },
            devices,
        )),
        Backend::DryRun => Arc::new(DryRunHypervisor::new(devices)),
    };
    let control_plane = Arc::new(HttpControlPlane::new(config.control_plane())?);

    let agent = Arc::new(Agent::new(
        config.agent_settings(),
        hypervisor,
        control_plane,
    )?);

    let app_state = Arc::new(api::AppState::new(
        agent.health(),
        AgentMetrics::new(),
        agent.clone(),
    ));
    let api_port = config.api_port;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server failed");
        }
    });

    if let Err(e) = agent.start().await {
        error!(error = %e, "Agent failed to start");
        if let Err(stop_err) = agent.stop().await {
            warn!(error = %stop_err, "Cleanup after failed start");
        }
        api_handle.abort();
        return Err(e);
    }

    let reason = shutdown_signal().await;
    info!(reason = reason, "Shutting down");

    let stopped = agent.stop().await;
    api_handle.abort();
    stopped
}

/// Devices from configuration, or NVML when built with it and none are listed
fn device_source(config: &AgentConfig) -> Arc<dyn DeviceSource> {
    if !config.devices.is_empty() {
        return Arc::new(StaticDeviceSource::new(config.devices.clone()));
    }

    #[cfg(feature = "nvml")]
    match fleet_agent_lib::hypervisor::NvmlDeviceSource::init() {
        Ok(source) => return Arc::new(source),
        Err(e) => warn!(error = %e, "NVML unavailable; no GPUs will be reported"),
    }

    Arc::new(StaticDeviceSource::default())
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = terminate.recv() => "SIGTERM received",
            },
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C received"
    }
}
