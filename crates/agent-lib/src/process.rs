//! Worker process termination
//!
//! Graceful signal, bounded wait, then escalation to a forceful kill of the
//! whole process group. Used by the local hypervisor backend for `StopWorker`
//! and by the agent during shutdown so no worker outlives the agent.

use crate::error::ProcessError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for worker termination
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long workers get to exit after the graceful signal (default: 20 seconds)
    pub graceful_timeout: Duration,
    /// Liveness poll interval during the wait phase
    pub poll_interval: Duration,
    /// How long to wait for exit after the forceful kill
    pub kill_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(100),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of a termination run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// Pids that exited within the graceful window
    pub graceful: Vec<u32>,
    /// Pids that had to be force-killed
    pub killed: Vec<u32>,
    /// Pids still alive after escalation
    pub survivors: Vec<u32>,
}

impl TerminationReport {
    pub fn is_clean(&self) -> bool {
        self.survivors.is_empty()
    }
}

/// Terminates worker processes by pid
#[derive(Debug, Clone, Default)]
pub struct ProcessLifecycleManager {
    config: LifecycleConfig,
}

impl ProcessLifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Terminate a single worker process
    pub async fn terminate(&self, pid: u32) -> TerminationReport {
        self.terminate_all(&[pid]).await
    }

    /// Terminate every pid, running to completion regardless of cancellation.
    ///
    /// The graceful signal goes to each pid; escalation kills the process
    /// group so children spawned by the worker binary are reaped too.
    pub async fn terminate_all(&self, pids: &[u32]) -> TerminationReport {
        let mut report = TerminationReport::default();
        let mut pending: Vec<u32> = Vec::new();

        for &pid in pids {
            if !is_alive(pid) {
                report.graceful.push(pid);
                continue;
            }
            if let Err(e) = send_terminate(pid) {
                warn!(pid = pid, error = %e, "Failed to send graceful termination signal");
            }
            pending.push(pid);
        }

        if pending.is_empty() {
            return report;
        }

        info!(
            count = pending.len(),
            timeout_secs = self.config.graceful_timeout.as_secs(),
            "Waiting for worker processes to exit"
        );

        let still_alive = self
            .wait_for_exit(pending.clone(), self.config.graceful_timeout)
            .await;
        for pid in &pending {
            if !still_alive.contains(pid) {
                report.graceful.push(*pid);
            }
        }

        if still_alive.is_empty() {
            return report;
        }

        for &pid in &still_alive {
            warn!(pid = pid, "Worker ignored termination signal, killing process group");
            if let Err(e) = kill_group_or_pid(pid) {
                warn!(pid = pid, error = %e, "Forceful kill failed");
            }
        }

        let survivors = self
            .wait_for_exit(still_alive.clone(), self.config.kill_timeout)
            .await;
        for pid in still_alive {
            if survivors.contains(&pid) {
                report.survivors.push(pid);
            } else {
                report.killed.push(pid);
            }
        }

        report
    }

    /// Poll until every pid has exited or the timeout passes; returns the survivors
    async fn wait_for_exit(&self, mut pids: Vec<u32>, timeout: Duration) -> Vec<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            pids.retain(|pid| is_alive(*pid));
            if pids.is_empty() || Instant::now() >= deadline {
                return pids;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Check whether a pid refers to a live (non-zombie) process
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        // Exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(e) => {
            debug!(pid = pid, error = %e, "Liveness probe failed");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// An exited but unreaped child still answers signal 0
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_proc_state(&stat))
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Extract the state character from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or parens,
/// so the state is the first field after the last `)`.
#[cfg(target_os = "linux")]
fn parse_proc_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Send the graceful termination signal (SIGTERM) to one pid
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) -> Result<(), ProcessError> {
    Err(ProcessError::Unsupported)
}

/// SIGKILL the process group led by `pid`, falling back to the pid alone
#[cfg(unix)]
pub fn kill_group_or_pid(pid: u32) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    match killpg(target, Signal::SIGKILL) {
        Ok(()) => return Ok(()),
        Err(e) => debug!(pid = pid, error = %e, "Group kill not permitted, killing pid"),
    }

    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn kill_group_or_pid(_pid: u32) -> Result<(), ProcessError> {
    Err(ProcessError::Unsupported)
}
