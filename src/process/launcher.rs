use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::registry::ManagedProcess;
use crate::config::ServiceDescriptor;
use crate::error::{Result, SupervisorError};

/// Spawns service processes, each leading its own process group so a single
/// group-directed signal reaches everything the service forks.
///
/// Launching never touches the registry; the caller registers the returned
/// process only after the spawn succeeded.
#[derive(Debug, Default, Clone)]
pub struct Launcher {
    working_dir: Option<PathBuf>,
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run services from `dir` instead of the current directory
    pub fn with_working_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }

    pub fn launch(&self, descriptor: &ServiceDescriptor) -> Result<ManagedProcess> {
        let name = descriptor.name.as_str();
        let spec = &descriptor.command;

        // Find the binary in PATH, falling back to the name as given
        let program = which::which(&spec.program).unwrap_or_else(|_| PathBuf::from(&spec.program));
        debug!("Launching {}: {:?} {:?}", name, program, spec.args);

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            // New group led by the child: pgid == pid
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {} ({}): {}", name, spec, e);
            SupervisorError::Spawn {
                name: name.to_string(),
                source: e,
            }
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            name: name.to_string(),
            source: io::Error::other("spawned child has no pid"),
        })?;

        info!("Spawned {} (PID: {})", name, pid);
        Ok(ManagedProcess::new(name, pid, pid, child))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    #[tokio::test]
    async fn test_launch_in_own_process_group() {
        let launcher = Launcher::new();
        let process = launcher
            .launch(&ServiceDescriptor::new("sleeper", CommandSpec::new("sleep", &["30"])))
            .unwrap();

        assert!(process.pid() > 0);
        assert_eq!(process.pid(), process.pgid());

        let child_pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(process.pid() as i32)))
            .unwrap()
            .as_raw();
        assert_eq!(child_pgid as u32, process.pid());
        assert_ne!(child_pgid, nix::unistd::getpgrp().as_raw());

        process.lock_child().await.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let launcher = Launcher::new();
        let err = launcher
            .launch(&ServiceDescriptor::new(
                "ghost",
                CommandSpec::new("/nonexistent/controlpanel-ghost", &[]),
            ))
            .unwrap_err();

        match err {
            SupervisorError::Spawn { name, source } => {
                assert_eq!(name, "ghost");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            e => panic!("Expected Spawn error, got: {}", e),
        }
    }

    #[tokio::test]
    async fn test_launch_uses_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::with_working_dir(dir.path());
        let process = launcher
            .launch(&ServiceDescriptor::new(
                "writer",
                CommandSpec::new("sh", &["-c", "touch marker"]),
            ))
            .unwrap();

        let status = process.lock_child().await.wait().await.unwrap();
        assert!(status.success());
        assert!(dir.path().join("marker").exists());
    }
}
