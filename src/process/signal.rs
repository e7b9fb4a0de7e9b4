//! Group-directed termination primitives.
//!
//! The termination policy speaks only in terms of "ask the group to stop" and
//! "kill the group". On Unix these are SIGTERM and SIGKILL sent to the
//! process group; on Windows they map to `taskkill /T` with and without `/F`.
//! A target that no longer exists counts as successfully signaled.

use std::io;
use tokio::process::Child;
use tracing::debug;
#[cfg(unix)]
use tracing::warn;

use super::registry::ManagedProcess;

/// Delivers termination requests to a managed process and everything it spawned
pub trait ProcessSignaller: Send + Sync {
    /// Cooperative request the target may intercept
    fn terminate_group(&self, process: &ManagedProcess) -> io::Result<()>;

    /// Unconditional termination the target cannot intercept
    fn kill_group(&self, process: &ManagedProcess) -> io::Result<()>;

    /// Last resort when the group kill failed: kill the leader alone
    fn kill_leader(&self, child: &mut Child) -> io::Result<()> {
        child.start_kill()
    }
}

/// Signals delivered through the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignaller;

impl ProcessSignaller for OsSignaller {
    fn terminate_group(&self, process: &ManagedProcess) -> io::Result<()> {
        debug!(
            "Sending graceful termination to group {} ({})",
            process.pgid(),
            process.service_name()
        );
        platform::terminate_group(process.pgid())
    }

    fn kill_group(&self, process: &ManagedProcess) -> io::Result<()> {
        debug!(
            "Sending forceful termination to group {} ({})",
            process.pgid(),
            process.service_name()
        );
        platform::kill_group(process.pgid())
    }
}

/// Best-effort synchronous kill used when the async machinery is unavailable
pub fn force_kill_group(pgid: u32) -> io::Result<()> {
    platform::kill_group(pgid)
}

#[cfg(unix)]
mod platform {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    pub fn terminate_group(pgid: u32) -> io::Result<()> {
        send(pgid, Signal::SIGTERM)
    }

    pub fn kill_group(pgid: u32) -> io::Result<()> {
        send(pgid, Signal::SIGKILL)
    }

    fn send(pgid: u32, signal: Signal) -> io::Result<()> {
        let raw = i32::try_from(pgid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
        // 0 and 1 would address our own group or init
        if raw <= 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal process group {}", raw),
            ));
        }

        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!("Process group {} already exited", pgid);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send {} to process group {}: {}", signal, pgid, e);
                Err(io::Error::from(e))
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::process::CommandExt;
    use std::process::Command;

    const CREATE_NO_WINDOW: u32 = 0x08000000;
    // taskkill exit code when the pid does not exist
    const TASKKILL_NOT_FOUND: i32 = 128;

    pub fn terminate_group(pgid: u32) -> io::Result<()> {
        taskkill(&["/T", "/PID", &pgid.to_string()])
    }

    pub fn kill_group(pgid: u32) -> io::Result<()> {
        taskkill(&["/F", "/T", "/PID", &pgid.to_string()])
    }

    fn taskkill(args: &[&str]) -> io::Result<()> {
        let output = Command::new("taskkill")
            .args(args)
            .creation_flags(CREATE_NO_WINDOW)
            .output()?;

        if output.status.success() || output.status.code() == Some(TASKKILL_NOT_FOUND) {
            return Ok(());
        }
        Err(io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
