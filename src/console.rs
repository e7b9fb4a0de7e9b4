/// Line-oriented control console
/// Stands in for the control-panel window: reads commands from stdin, hands
/// lifecycle work to worker tasks and prints the status log from the event
/// stream. It never waits on a process itself.
use chrono::{DateTime, Local};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{OperationPhase, SupervisorEvent};
use crate::process::{ProcessInfo, ServiceState, StopPhase};
use crate::supervisor::{LifecycleCommand, Supervisor};

const HELP: &str = "commands: start <name> | stop <name> | start-all | stop-all | status | services | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Lifecycle(LifecycleCommand),
    Status,
    Services,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments for {}", verb));
    }

    let command = match (verb.to_ascii_lowercase().as_str(), arg) {
        ("start", Some(name)) => ConsoleCommand::Lifecycle(LifecycleCommand::Start(name.to_string())),
        ("stop", Some(name)) => ConsoleCommand::Lifecycle(LifecycleCommand::Stop(name.to_string())),
        ("start" | "stop", None) => return Err(format!("usage: {} <name>", verb)),
        ("start-all", None) => ConsoleCommand::Lifecycle(LifecycleCommand::StartAll),
        ("stop-all", None) => ConsoleCommand::Lifecycle(LifecycleCommand::StopAll),
        ("status", None) => ConsoleCommand::Status,
        ("services" | "list", None) => ConsoleCommand::Services,
        ("help" | "?", None) => ConsoleCommand::Help,
        ("quit" | "exit" | "q", None) => ConsoleCommand::Quit,
        (other, _) => return Err(format!("unknown command {:?}", other)),
    };
    Ok(Some(command))
}

/// Status-log wording for an event, or None for events the log skips
pub fn describe_event(event: &SupervisorEvent) -> Option<String> {
    match event {
        SupervisorEvent::ServiceStateChanged {
            name,
            new_state,
            pid,
            ..
        } => match new_state {
            ServiceState::Running => Some(match pid {
                Some(pid) => format!("Started {} (PID: {})", name, pid),
                None => format!("Started {}", name),
            }),
            ServiceState::Stopping(StopPhase::Graceful) => Some(format!("Stopping {}...", name)),
            ServiceState::Stopping(StopPhase::Forceful) => {
                Some(format!("Force killing {}...", name))
            }
            ServiceState::Stopped => Some(format!("Stopped {}", name)),
            ServiceState::Starting => None,
        },
        SupervisorEvent::OperationFailed {
            name,
            phase,
            message,
        } => Some(match phase {
            OperationPhase::Start => format!("Failed to start {}: {}", name, message),
            OperationPhase::Stop => format!("Failed to stop {}: {}", name, message),
        }),
        SupervisorEvent::OperationRejected { message, .. } => Some(message.clone()),
        SupervisorEvent::Progress { message } => Some(message.clone()),
        SupervisorEvent::ShutdownStarted => Some("Cleaning up all processes...".to_string()),
        SupervisorEvent::ShutdownCompleted { failures } if failures.is_empty() => {
            Some("All processes cleaned up.".to_string())
        }
        SupervisorEvent::ShutdownCompleted { failures } => Some(format!(
            "Shutdown finished with errors: {}",
            failures
                .iter()
                .map(|(name, message)| format!("{} ({})", name, message))
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

pub fn format_log_line(at: DateTime<Local>, message: &str) -> String {
    format!("[{}] {}", at.format("%H:%M:%S"), message)
}

/// One line per service: status marker, name, and pid when running
pub fn render_status(services: &[String], snapshot: &[ProcessInfo]) -> Vec<String> {
    services
        .iter()
        .map(|name| match snapshot.iter().find(|info| &info.name == name) {
            Some(info) => {
                let marker = if info.state == ServiceState::Running { "[+]" } else { "[~]" };
                match info.pid {
                    Some(pid) => format!("{} {} {} (PID: {})", marker, name, info.state, pid),
                    None => format!("{} {} {}", marker, name, info.state),
                }
            }
            None => format!("[-] {} stopped", name),
        })
        .collect()
}

/// Print the status log until the shutdown sweep reports completion
pub fn spawn_status_log(events: broadcast::Receiver<SupervisorEvent>) -> JoinHandle<()> {
    spawn_status_log_to(events, std::io::stdout())
}

/// Status log over any sink. Write failures are logged and skipped: a closed
/// terminal must not stop the log from following the shutdown sweep.
pub fn spawn_status_log_to<W>(
    mut events: broadcast::Receiver<SupervisorEvent>,
    mut sink: W,
) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        let mut sink_failed = false;
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(message) = describe_event(&event) {
                        let line = format_log_line(Local::now(), &message);
                        if let Err(e) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
                            if !sink_failed {
                                warn!("Status log output failed: {}", e);
                                sink_failed = true;
                            }
                        }
                    }
                    if matches!(event, SupervisorEvent::ShutdownCompleted { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Status log skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Console output that tolerates a vanished stdout
fn say(line: &str) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", line) {
        debug!("Console output failed: {}", e);
    }
}

/// Serve console commands until `quit` or end of input
pub async fn run_console(supervisor: Supervisor) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    say(HELP);

    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                say(&message);
                continue;
            }
        };
        debug!("console command: {:?}", command);

        match command {
            ConsoleCommand::Lifecycle(lifecycle) => {
                // Fire and forget: results come back through the status log
                supervisor.dispatch(lifecycle);
            }
            ConsoleCommand::Status => {
                supervisor.reap_exited();
                let services: Vec<String> =
                    supervisor.catalog().names().map(str::to_string).collect();
                for line in render_status(&services, &supervisor.snapshot()) {
                    say(&line);
                }
            }
            ConsoleCommand::Services => {
                for descriptor in supervisor.catalog().service_descriptors() {
                    say(&format!("{}: {}", descriptor.name, descriptor.command));
                }
            }
            ConsoleCommand::Help => say(HELP),
            ConsoleCommand::Quit => break,
        }
    }
    Ok(())
}
