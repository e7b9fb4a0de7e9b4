/// Process-wide teardown
/// One idempotent routine stops every managed service. It is reached from
/// the console (stop on quit / end of input), from OS termination signals
/// and from the normal exit path of `run()`; whichever trigger fires first
/// does the work and the others return at once.
use futures_util::stream::{self, StreamExt};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::events::SupervisorEvent;
use crate::process::{signal, ProcessRegistry, ServiceState, StopOutcome};
use crate::supervisor::Supervisor;

/// Aggregate result of one shutdown sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// This call performed the teardown
    Completed(ShutdownReport),
    /// Another trigger got there first
    AlreadyInProgress,
}

pub struct ShutdownCoordinator {
    supervisor: Supervisor,
    started: AtomicBool,
    done: watch::Sender<Option<ShutdownReport>>,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Supervisor) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            supervisor,
            started: AtomicBool::new(false),
            done,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop every managed service, at most once per coordinator
    pub async fn shutdown_all(&self) -> ShutdownOutcome {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return ShutdownOutcome::AlreadyInProgress;
        }

        let events = self.supervisor.events();
        events.emit(SupervisorEvent::ShutdownStarted);

        let names = self.supervisor.begin_shutdown();
        info!("Cleaning up {} processes...", names.len());

        let results: Vec<(String, Result<Option<StopOutcome>, SupervisorError>)> =
            stream::iter(names)
                .map(|name| async move {
                    let result = self.stop_for_shutdown(&name).await;
                    (name, result)
                })
                .buffer_unordered(self.supervisor.max_workers())
                .collect()
                .await;

        let mut report = ShutdownReport::default();
        for (name, result) in results {
            match result {
                Ok(Some(_)) => report.stopped.push(name),
                Ok(None) => {}
                Err(e) => {
                    error!("Error stopping {}: {}", name, e);
                    report.failures.push((name, e.to_string()));
                }
            }
        }
        report.stopped.sort();
        report.failures.sort();

        if report.is_clean() {
            info!("All processes cleaned up.");
        } else {
            warn!(
                "Shutdown finished with {} failures: {:?}",
                report.failures.len(),
                report.failures
            );
        }

        events.emit(SupervisorEvent::ShutdownCompleted {
            failures: report.failures.clone(),
        });
        self.done.send_replace(Some(report.clone()));
        ShutdownOutcome::Completed(report)
    }

    /// Wait for whichever trigger ran the teardown to finish
    pub async fn wait_completed(&self) -> ShutdownReport {
        let mut rx = self.done.subscribe();
        let report = match rx.wait_for(|report| report.is_some()).await {
            Ok(report) => report.clone().unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        };
        report
    }

    /// Run the teardown and wait for it even if another trigger started it
    pub async fn shutdown_and_wait(&self) -> ShutdownReport {
        match self.shutdown_all().await {
            ShutdownOutcome::Completed(report) => report,
            ShutdownOutcome::AlreadyInProgress => self.wait_completed().await,
        }
    }

    /// Stop one service, waiting out any start or stop already in flight
    async fn stop_for_shutdown(&self, name: &str) -> Result<Option<StopOutcome>, SupervisorError> {
        loop {
            match self.supervisor.stop_service(name).await {
                Ok(outcome) => return Ok(Some(outcome)),
                // Someone else finished it first
                Err(SupervisorError::NotRunning(_)) => return Ok(None),
                Err(SupervisorError::Busy(_)) => {
                    let state = self.supervisor.registry().wait_idle(name).await;
                    if state == ServiceState::Stopped {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Resolves when the process is asked to terminate: Ctrl-C, SIGTERM, or the
/// controlling terminal going away.
pub async fn termination_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
            _ = sighup.recv() => Ok("SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
    }
}

/// Force-kill every registered process group if the host panics
pub fn install_panic_hook(registry: Arc<ProcessRegistry>) {
    std::panic::set_hook(Box::new(move |panic_info| {
        // stderr may be closed as well
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "Application panic: {:?}", panic_info);
        for (name, pgid) in registry.process_groups() {
            let _ = match signal::force_kill_group(pgid) {
                Ok(()) => writeln!(stderr, "Killed {} (group {}) on panic", name, pgid),
                Err(e) => writeln!(
                    stderr,
                    "Failed to kill {} (group {}) on panic: {}",
                    name, pgid, e
                ),
            };
        }
        std::process::exit(1);
    }));
}
