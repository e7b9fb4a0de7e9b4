use std::io;
use thiserror::Error;

/// Failures of a single lifecycle operation.
///
/// `AlreadyRunning`, `NotRunning`, `Busy` and `ShuttingDown` are rejections:
/// the request was refused before anything happened to a process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Service {0} is not configured")]
    UnknownService(String),

    #[error("Service {0} is already running")]
    AlreadyRunning(String),

    #[error("Service {0} is not running")]
    NotRunning(String),

    #[error("Service {0} is busy with another operation")]
    Busy(String),

    #[error("Cannot start {0}: shutdown in progress")]
    ShuttingDown(String),

    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Process {pid} of {name} is still alive after forceful termination")]
    Unkillable { name: String, pid: u32 },

    #[error("Failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// True for refusals that leave every process and the registry untouched
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning(_) | Self::NotRunning(_) | Self::Busy(_) | Self::ShuttingDown(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections() {
        assert!(SupervisorError::AlreadyRunning("a".into()).is_rejection());
        assert!(SupervisorError::NotRunning("a".into()).is_rejection());
        assert!(SupervisorError::Busy("a".into()).is_rejection());
        assert!(!SupervisorError::UnknownService("a".into()).is_rejection());
        assert!(!SupervisorError::Unkillable { name: "a".into(), pid: 1 }.is_rejection());
    }

    #[test]
    fn test_messages_match_status_log_wording() {
        assert_eq!(
            SupervisorError::AlreadyRunning("auth_service.py".into()).to_string(),
            "Service auth_service.py is already running"
        );
        assert_eq!(
            SupervisorError::NotRunning("auth_service.py".into()).to_string(),
            "Service auth_service.py is not running"
        );
    }
}
