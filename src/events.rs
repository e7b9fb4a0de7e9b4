/// Lifecycle events published by the supervisor.
/// Workers only ever send; presentation code subscribes and renders.
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::process::ServiceState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which half of the lifecycle an operation belonged to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    ServiceStateChanged {
        name: String,
        old_state: ServiceState,
        new_state: ServiceState,
        pid: Option<u32>,
    },
    OperationFailed {
        name: String,
        phase: OperationPhase,
        message: String,
    },
    /// A request refused without side effects (already running, not running, busy)
    OperationRejected {
        name: String,
        phase: OperationPhase,
        message: String,
    },
    /// Free-form progress from the setup phase
    Progress { message: String },
    ShutdownStarted,
    ShutdownCompleted { failures: Vec<(String, String)> },
}

/// One-way fan-out channel for supervisor events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no listeners is not an error.
    pub fn emit(&self, event: SupervisorEvent) {
        debug!("event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn state_changed(
        &self,
        name: &str,
        old_state: ServiceState,
        new_state: ServiceState,
        pid: Option<u32>,
    ) {
        self.emit(SupervisorEvent::ServiceStateChanged {
            name: name.to_string(),
            old_state,
            new_state,
            pid,
        });
    }

    pub fn failed(&self, name: &str, phase: OperationPhase, message: impl Into<String>) {
        self.emit(SupervisorEvent::OperationFailed {
            name: name.to_string(),
            phase,
            message: message.into(),
        });
    }

    pub fn rejected(&self, name: &str, phase: OperationPhase, message: impl Into<String>) {
        self.emit(SupervisorEvent::OperationRejected {
            name: name.to_string(),
            phase,
            message: message.into(),
        });
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.emit(SupervisorEvent::Progress {
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.state_changed("a", ServiceState::Stopped, ServiceState::Starting, None);

        let expected = SupervisorEvent::ServiceStateChanged {
            name: "a".to_string(),
            old_state: ServiceState::Stopped,
            new_state: ServiceState::Starting,
            pid: None,
        };
        assert_eq!(first.recv().await.unwrap(), expected);
        assert_eq!(second.recv().await.unwrap(), expected);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        bus.emit(SupervisorEvent::ShutdownStarted);
    }

    #[test]
    fn test_event_json_shape() {
        let event = SupervisorEvent::OperationFailed {
            name: "a".to_string(),
            phase: OperationPhase::Stop,
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "operation_failed");
        assert_eq!(json["phase"], "stop");
        assert_eq!(json["message"], "boom");
    }
}
