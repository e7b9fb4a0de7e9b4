/// Microservice supervisor
/// Owns the service catalog and process registry and exposes the lifecycle
/// operations the control panel drives:
/// - start / stop a single service
/// - start all / stop all
/// - the auto-start sweep at session start
///
/// Every outcome, including failures, is published on the event bus.
/// `dispatch` runs an operation on its own task so callers never block on
/// process waits.
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServiceCatalog;
use crate::error::{Result, SupervisorError};
use crate::events::{EventBus, OperationPhase};
use crate::process::{
    Launcher, ManagedProcess, OsSignaller, ProcessInfo, ProcessRegistry, ProcessSignaller, ServiceState,
    StopOutcome, StopPhase, TerminationPolicy, DEFAULT_GRACE_PERIOD,
};

/// Tuning knobs for a supervisor session
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub grace_period: Duration,
    /// Upper bound on concurrent stops during stop-all and shutdown
    pub max_workers: usize,
    pub launcher: Launcher,
    /// Bus the supervisor publishes on; share it to see setup-phase progress too
    pub events: EventBus,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_workers: 8,
            launcher: Launcher::new(),
            events: EventBus::new(),
        }
    }
}

/// A lifecycle request handed to a worker task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommand {
    Start(String),
    Stop(String),
    StartAll,
    StopAll,
}

struct Inner {
    catalog: ServiceCatalog,
    registry: Arc<ProcessRegistry>,
    launcher: Launcher,
    policy: TerminationPolicy,
    events: EventBus,
    max_workers: usize,
}

/// Cheaply cloneable handle; clones share one registry and event bus
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(catalog: ServiceCatalog, options: SupervisorOptions) -> Self {
        Self::with_signaller(catalog, options, Arc::new(OsSignaller))
    }

    pub fn with_signaller(
        catalog: ServiceCatalog,
        options: SupervisorOptions,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                registry: Arc::new(ProcessRegistry::new()),
                launcher: options.launcher,
                policy: TerminationPolicy::new(options.grace_period, signaller),
                events: options.events,
                max_workers: options.max_workers.max(1),
            }),
        }
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.inner.catalog
    }

    pub fn registry(&self) -> Arc<ProcessRegistry> {
        self.inner.registry.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner.registry.has(name)
    }

    pub fn state(&self, name: &str) -> ServiceState {
        self.inner.registry.state(name)
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.inner.registry.snapshot()
    }

    /// True once shutdown has closed the registry
    pub fn is_shutting_down(&self) -> bool {
        self.inner.registry.is_closed()
    }

    /// Start one service and return its pid
    pub async fn start_service(&self, name: &str) -> Result<u32> {
        let inner = &self.inner;
        let events = &inner.events;

        let descriptor = match inner.catalog.get(name) {
            Some(descriptor) => descriptor,
            None => {
                let err = SupervisorError::UnknownService(name.to_string());
                error!("{}", err);
                events.failed(name, OperationPhase::Start, err.to_string());
                return Err(err);
            }
        };

        if let Err(e) = inner.registry.reserve(name) {
            info!("{}", e);
            events.rejected(name, OperationPhase::Start, e.to_string());
            return Err(e);
        }
        events.state_changed(name, ServiceState::Stopped, ServiceState::Starting, None);

        match inner.launcher.launch(descriptor) {
            Ok(process) => {
                let pid = process.pid();
                inner.registry.commit(name, process);
                events.state_changed(name, ServiceState::Starting, ServiceState::Running, Some(pid));
                info!("Started {} (PID: {})", name, pid);
                Ok(pid)
            }
            Err(e) => {
                inner.registry.release(name);
                events.state_changed(name, ServiceState::Starting, ServiceState::Stopped, None);
                events.failed(name, OperationPhase::Start, e.to_string());
                Err(e)
            }
        }
    }

    /// Stop one service, waiting until its process has exited
    pub async fn stop_service(&self, name: &str) -> Result<StopOutcome> {
        let inner = &self.inner;
        let events = &inner.events;

        let process = match inner.registry.begin_stop(name) {
            Ok(process) => process,
            Err(e) => {
                info!("{}", e);
                events.rejected(name, OperationPhase::Stop, e.to_string());
                return Err(e);
            }
        };
        let pid = Some(process.pid());
        let graceful = ServiceState::Stopping(StopPhase::Graceful);
        let forceful = ServiceState::Stopping(StopPhase::Forceful);
        events.state_changed(name, ServiceState::Running, graceful, pid);

        let mut current = graceful;
        let result = inner
            .policy
            .stop(&process, || {
                inner.registry.set_state(name, forceful);
                events.state_changed(name, graceful, forceful, pid);
                current = forceful;
            })
            .await;

        match result {
            Ok(outcome) => {
                inner.registry.remove(name);
                events.state_changed(name, current, ServiceState::Stopped, pid);
                info!("Stopped {}", name);
                Ok(outcome)
            }
            Err(e) => {
                self.settle_failed_stop(name, &process, current, &e).await;
                Err(e)
            }
        }
    }

    /// Reconcile the registry after a stop returned an error: the entry goes
    /// only if the process is gone, otherwise it is running again.
    async fn settle_failed_stop(
        &self,
        name: &str,
        process: &ManagedProcess,
        from: ServiceState,
        err: &SupervisorError,
    ) {
        let inner = &self.inner;
        let pid = Some(process.pid());
        error!("Failed to stop {}: {}", name, err);

        if process.has_exited().await {
            inner.registry.remove(name);
            inner.events.state_changed(name, from, ServiceState::Stopped, pid);
        } else {
            error!("{} (PID: {}) is still alive after a failed stop", name, process.pid());
            inner.registry.set_state(name, ServiceState::Running);
            inner.events.state_changed(name, from, ServiceState::Running, pid);
        }
        inner.events.failed(name, OperationPhase::Stop, err.to_string());
    }

    /// Start every configured service in catalog order.
    /// Returns the services that failed for reasons other than already running.
    pub async fn start_all(&self) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        let names: Vec<String> = self.inner.catalog.names().map(str::to_string).collect();
        for name in names {
            if let Err(e) = self.start_service(&name).await {
                if !e.is_rejection() {
                    failures.push((name, e.to_string()));
                }
            }
        }
        failures
    }

    /// Stop every registered service concurrently. Does nothing once shutdown began.
    pub async fn stop_all(&self) -> Vec<(String, String)> {
        if self.is_shutting_down() {
            info!("Shutdown in progress, ignoring stop all");
            return Vec::new();
        }

        let names = self.inner.registry.names();
        stream::iter(names)
            .map(|name| async move {
                let result = self.stop_service(&name).await;
                (name, result)
            })
            .buffer_unordered(self.inner.max_workers)
            .filter_map(|(name, result)| async move {
                match result {
                    Err(e) if !e.is_rejection() => Some((name, e.to_string())),
                    _ => None,
                }
            })
            .collect()
            .await
    }

    /// Start each auto-start entry once, in listed order. Names missing from the
    /// catalog are reported as configuration errors and skipped.
    pub async fn auto_start(&self) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        let names = self.inner.catalog.auto_start_names().to_vec();
        for name in names {
            if !self.inner.catalog.contains(&name) {
                let message = format!(
                    "Auto-start entry {} is not a configured microservice",
                    name
                );
                warn!("{}", message);
                self.inner
                    .events
                    .failed(&name, OperationPhase::Start, message.clone());
                failures.push((name, message));
                continue;
            }
            if let Err(e) = self.start_service(&name).await {
                if !e.is_rejection() {
                    failures.push((name, e.to_string()));
                }
            }
        }
        failures
    }

    /// Remove entries whose process exited without being stopped.
    /// Entries whose child handle is busy are skipped, so this never waits.
    /// Returns the names that were reconciled.
    pub fn reap_exited(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for (name, process) in self.inner.registry.running() {
            if process.exited_if_idle() != Some(true) {
                continue;
            }
            if self.inner.registry.remove_if_running(&name, &process) {
                warn!("{} (PID: {}) exited on its own", name, process.pid());
                self.inner.events.state_changed(
                    &name,
                    ServiceState::Running,
                    ServiceState::Stopped,
                    Some(process.pid()),
                );
                reaped.push(name);
            }
        }
        reaped
    }

    /// Run a lifecycle command on a worker task. Results arrive as events.
    pub fn dispatch(&self, command: LifecycleCommand) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            match command {
                LifecycleCommand::Start(name) => {
                    let _ = supervisor.start_service(&name).await;
                }
                LifecycleCommand::Stop(name) => {
                    let _ = supervisor.stop_service(&name).await;
                }
                LifecycleCommand::StartAll => {
                    supervisor.start_all().await;
                }
                LifecycleCommand::StopAll => {
                    supervisor.stop_all().await;
                }
            }
        })
    }

    /// Close the registry to new starts and return every name still registered
    pub(crate) fn begin_shutdown(&self) -> Vec<String> {
        self.inner.registry.close()
    }
}
