use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};

/// Sub-state of a stop in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPhase {
    Graceful,
    Forceful,
}

/// Lifecycle state of a service.
/// `Stopped` is never stored: it is the absence of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping(StopPhase),
}

impl ServiceState {
    /// True while a start or stop is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping(_))
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping(StopPhase::Graceful) => write!(f, "stopping"),
            Self::Stopping(StopPhase::Forceful) => write!(f, "killing"),
        }
    }
}

/// A live OS process bound to a service name.
/// The child handle sits behind an async mutex so a stop can hold it across waits.
pub struct ManagedProcess {
    service_name: String,
    pid: u32,
    pgid: u32,
    started_at: DateTime<Utc>,
    child: AsyncMutex<Child>,
}

impl ManagedProcess {
    pub fn new(service_name: impl Into<String>, pid: u32, pgid: u32, child: Child) -> Self {
        Self {
            service_name: service_name.into(),
            pid,
            pgid,
            started_at: Utc::now(),
            child: AsyncMutex::new(child),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group id; the leader's pid when launched in its own group
    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) async fn lock_child(&self) -> AsyncMutexGuard<'_, Child> {
        self.child.lock().await
    }

    /// Non-blocking exit check. Reaps the child if it has exited.
    pub async fn try_exit_status(&self) -> std::io::Result<Option<ExitStatus>> {
        self.child.lock().await.try_wait()
    }

    /// Exit check that never waits for the child handle.
    /// `None` while someone else holds it, e.g. a stop in progress.
    pub fn exited_if_idle(&self) -> Option<bool> {
        let mut child = self.child.try_lock().ok()?;
        match child.try_wait() {
            Ok(status) => Some(status.is_some()),
            Err(e) => {
                warn!("Error checking status of {}: {}", self.service_name, e);
                Some(false)
            }
        }
    }

    pub async fn has_exited(&self) -> bool {
        match self.try_exit_status().await {
            Ok(status) => status.is_some(),
            Err(e) => {
                warn!("Error checking status of {}: {}", self.service_name, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("service_name", &self.service_name)
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("started_at", &self.started_at)
            .finish()
    }
}

/// Read-only view of one registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

struct Slot {
    state: ServiceState,
    process: Option<Arc<ManagedProcess>>,
}

#[derive(Default)]
struct Table {
    slots: BTreeMap<String, Slot>,
    closed: bool,
}

/// Registry of managed service processes, keyed by service name.
///
/// Every method takes the table lock once, so check-and-mutate sequences are
/// atomic. A name is present iff its service is running or transitioning.
pub struct ProcessRegistry {
    table: Mutex<Table>,
    changed: Notify,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            changed: Notify::new(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.table.lock().slots.contains_key(name)
    }

    pub fn state(&self, name: &str) -> ServiceState {
        self.table
            .lock()
            .slots
            .get(name)
            .map(|slot| slot.state)
            .unwrap_or(ServiceState::Stopped)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.table
            .lock()
            .slots
            .get(name)
            .and_then(|slot| slot.process.clone())
    }

    /// Register an already launched process as running
    pub fn insert(&self, name: &str, process: ManagedProcess) -> Result<Arc<ManagedProcess>> {
        let process = Arc::new(process);
        {
            let mut table = self.table.lock();
            Self::check_vacant(&table, name)?;
            table.slots.insert(
                name.to_string(),
                Slot {
                    state: ServiceState::Running,
                    process: Some(process.clone()),
                },
            );
        }
        info!("Registered {} (PID: {})", name, process.pid());
        self.changed.notify_waiters();
        Ok(process)
    }

    /// Claim `name` for a start in progress. The claim blocks other starts and
    /// stops until it is committed or released.
    pub fn reserve(&self, name: &str) -> Result<()> {
        {
            let mut table = self.table.lock();
            Self::check_vacant(&table, name)?;
            table.slots.insert(
                name.to_string(),
                Slot {
                    state: ServiceState::Starting,
                    process: None,
                },
            );
        }
        debug!("Reserved {} for start", name);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Attach the launched process to a reservation and mark it running
    pub fn commit(&self, name: &str, process: ManagedProcess) -> Arc<ManagedProcess> {
        let process = Arc::new(process);
        {
            let mut table = self.table.lock();
            let slot = table.slots.entry(name.to_string()).or_insert(Slot {
                state: ServiceState::Starting,
                process: None,
            });
            slot.state = ServiceState::Running;
            slot.process = Some(process.clone());
        }
        info!("Registered {} (PID: {})", name, process.pid());
        self.changed.notify_waiters();
        process
    }

    /// Drop a reservation after a failed launch
    pub fn release(&self, name: &str) {
        let released = {
            let mut table = self.table.lock();
            match table.slots.get(name) {
                Some(slot) if slot.state == ServiceState::Starting => {
                    table.slots.remove(name);
                    true
                }
                _ => false,
            }
        };
        if released {
            debug!("Released reservation for {}", name);
            self.changed.notify_waiters();
        }
    }

    /// Move a running entry into `Stopping(Graceful)` and hand out its process
    pub fn begin_stop(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        let process = {
            let mut table = self.table.lock();
            let slot = table
                .slots
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;
            match (&slot.state, &slot.process) {
                (ServiceState::Running, Some(process)) => {
                    slot.state = ServiceState::Stopping(StopPhase::Graceful);
                    process.clone()
                }
                _ => return Err(SupervisorError::Busy(name.to_string())),
            }
        };
        self.changed.notify_waiters();
        Ok(process)
    }

    /// Overwrite the state of an existing entry. Absent names are ignored.
    pub fn set_state(&self, name: &str, state: ServiceState) {
        let updated = {
            let mut table = self.table.lock();
            match table.slots.get_mut(name) {
                Some(slot) => {
                    slot.state = state;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.changed.notify_waiters();
        }
    }

    /// Delete an entry. No-op when absent.
    pub fn remove(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        let removed = self.table.lock().slots.remove(name);
        match removed {
            Some(slot) => {
                info!("Unregistered {}", name);
                self.changed.notify_waiters();
                slot.process
            }
            None => {
                debug!("Tried to unregister {} which is not registered", name);
                None
            }
        }
    }

    /// Remove `name` only if it is still running the given process
    pub fn remove_if_running(&self, name: &str, process: &Arc<ManagedProcess>) -> bool {
        let removed = {
            let mut table = self.table.lock();
            let matches = table.slots.get(name).is_some_and(|slot| {
                slot.state == ServiceState::Running
                    && slot
                        .process
                        .as_ref()
                        .is_some_and(|p| Arc::ptr_eq(p, process))
            });
            if matches {
                table.slots.remove(name);
            }
            matches
        };
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.table
            .lock()
            .slots
            .iter()
            .map(|(name, slot)| ProcessInfo {
                name: name.clone(),
                state: slot.state,
                pid: slot.process.as_ref().map(|p| p.pid()),
                started_at: slot.process.as_ref().map(|p| p.started_at()),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.table.lock().slots.keys().cloned().collect()
    }

    /// Entries currently in `Running` with their processes
    pub fn running(&self) -> Vec<(String, Arc<ManagedProcess>)> {
        self.table
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == ServiceState::Running)
            .filter_map(|(name, slot)| slot.process.clone().map(|p| (name.clone(), p)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse every future reservation and return the names registered at
    /// the moment of closing.
    pub fn close(&self) -> Vec<String> {
        let names = {
            let mut table = self.table.lock();
            table.closed = true;
            table.slots.keys().cloned().collect()
        };
        self.changed.notify_waiters();
        names
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Wait until `name` is not mid-transition and return its state
    pub async fn wait_idle(&self, name: &str) -> ServiceState {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state(name);
            if !state.is_transitioning() {
                return state;
            }
            notified.await;
        }
    }

    /// Process groups of every entry with a live handle.
    /// Gives up after a short wait so a panicking lock holder cannot wedge the caller.
    pub fn process_groups(&self) -> Vec<(String, u32)> {
        match self.table.try_lock_for(Duration::from_millis(200)) {
            Some(table) => table
                .slots
                .iter()
                .filter_map(|(name, slot)| slot.process.as_ref().map(|p| (name.clone(), p.pgid())))
                .collect(),
            None => Vec::new(),
        }
    }

    fn check_vacant(table: &Table, name: &str) -> Result<()> {
        if table.closed {
            return Err(SupervisorError::ShuttingDown(name.to_string()));
        }
        if table.slots.contains_key(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        Ok(())
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
