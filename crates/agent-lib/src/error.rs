//! Typed errors for the hypervisor facade and process lifecycle

use thiserror::Error;

/// Errors returned by [`crate::hypervisor::Hypervisor`] implementations
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The facade was used before `start()` or after `stop()`
    #[error("hypervisor is not started")]
    NotStarted,

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("worker {0} already exists")]
    WorkerAlreadyExists(String),

    #[error("failed to launch worker {worker_id}: {reason}")]
    Launch { worker_id: String, reason: String },

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl HypervisorError {
    pub fn launch(worker_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Launch {
            worker_id: worker_id.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the not-started sentinel
    pub fn is_not_started(&self) -> bool {
        matches!(self, HypervisorError::NotStarted)
    }
}

/// Errors raised while signalling worker processes
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("process control is not supported on this platform")]
    Unsupported,
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;
