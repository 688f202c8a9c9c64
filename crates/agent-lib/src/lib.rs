//! Agent library for node-resident GPU worker fleets
//!
//! This crate provides the core functionality for:
//! - Driving GPU worker processes through a hypervisor facade
//! - Reconciling declared workers against what is actually running
//! - Pulling config and pushing change-flagged status to the control plane
//! - Reacting to server-push restart and config events
//! - Health checks and observability

pub mod agent;
pub mod error;
pub mod health;
pub mod hypervisor;
pub mod models;
pub mod observability;
pub mod process;
pub mod reconciler;
pub mod status;
pub mod sync;
mod ticker;

pub use agent::{Agent, AgentSettings, AgentStatus};
pub use error::{HypervisorError, ProcessError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
