/// Process management for configured services
/// Tracks every spawned service in one registry and tears process groups
/// down with a graceful-then-forceful policy so nothing outlives the panel

pub mod launcher;
pub mod registry;
pub mod signal;
pub mod termination;

pub use launcher::Launcher;
pub use registry::{ManagedProcess, ProcessInfo, ProcessRegistry, ServiceState, StopPhase};
pub use signal::{OsSignaller, ProcessSignaller};
pub use termination::{StopOutcome, TerminationPolicy, DEFAULT_GRACE_PERIOD};
