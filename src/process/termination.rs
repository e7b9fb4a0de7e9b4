use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::registry::ManagedProcess;
use super::signal::{OsSignaller, ProcessSignaller};
use crate::error::{Result, SupervisorError};

/// Default wait between the graceful request and the forceful kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to look for an exit after every kill primitive failed
const KILL_FAILURE_RECHECK: Duration = Duration::from_millis(500);

/// How a stop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had exited before any signal was sent
    AlreadyExited(ExitStatus),
    /// Exited within the grace period
    Graceful(ExitStatus),
    /// Needed the forceful kill
    Forced(ExitStatus),
}

impl StopOutcome {
    pub fn status(&self) -> ExitStatus {
        match self {
            Self::AlreadyExited(s) | Self::Graceful(s) | Self::Forced(s) => *s,
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self, Self::Forced(_))
    }
}

/// Graceful-then-forceful shutdown of a single managed process.
///
/// A stop always runs to a confirmed exit: the graceful wait is bounded by
/// the grace period, the wait after the forceful kill is not.
#[derive(Clone)]
pub struct TerminationPolicy {
    grace_period: Duration,
    signaller: Arc<dyn ProcessSignaller>,
}

impl TerminationPolicy {
    pub fn new(grace_period: Duration, signaller: Arc<dyn ProcessSignaller>) -> Self {
        Self {
            grace_period,
            signaller,
        }
    }

    pub fn with_os_signals(grace_period: Duration) -> Self {
        Self::new(grace_period, Arc::new(OsSignaller))
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Stop `process`, calling `on_escalate` once if the forceful phase begins.
    pub async fn stop<F>(&self, process: &ManagedProcess, on_escalate: F) -> Result<StopOutcome>
    where
        F: FnOnce(),
    {
        let name = process.service_name();
        let pid = process.pid();
        let wait_error = |source| SupervisorError::Wait {
            name: name.to_string(),
            source,
        };

        let mut child = process.lock_child().await;

        // A service that died on its own is already where we want it
        if let Some(status) = child.try_wait().map_err(wait_error)? {
            info!("{} (PID: {}) had already exited: {}", name, pid, status);
            return Ok(StopOutcome::AlreadyExited(status));
        }

        info!("Terminating {} (PID: {})...", name, pid);
        match self.signaller.terminate_group(process) {
            Ok(()) => match tokio::time::timeout(self.grace_period, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("{} exited gracefully: {}", name, status);
                    return Ok(StopOutcome::Graceful(status));
                }
                Ok(Err(e)) => return Err(wait_error(e)),
                Err(_) => {
                    warn!(
                        "{} (PID: {}) did not exit within {:?}",
                        name, pid, self.grace_period
                    );
                }
            },
            Err(e) => {
                warn!("Graceful termination of {} failed: {}", name, e);
                if let Some(status) = child.try_wait().map_err(wait_error)? {
                    return Ok(StopOutcome::AlreadyExited(status));
                }
            }
        }

        on_escalate();
        warn!("Force killing {} (PID: {})...", name, pid);

        if let Err(group_err) = self.signaller.kill_group(process) {
            error!("Failed to kill process group of {}: {}", name, group_err);

            if let Err(e) = self.signaller.kill_leader(&mut *child) {
                error!("Failed to kill {} (PID: {}) directly: {}", name, pid, e);
                return match tokio::time::timeout(KILL_FAILURE_RECHECK, child.wait()).await {
                    Ok(Ok(status)) => Ok(StopOutcome::Forced(status)),
                    _ => Err(SupervisorError::Unkillable {
                        name: name.to_string(),
                        pid,
                    }),
                };
            }
        }

        let status = child.wait().await.map_err(wait_error)?;
        info!("{} killed: {}", name, status);
        Ok(StopOutcome::Forced(status))
    }
}

impl std::fmt::Debug for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationPolicy")
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}
