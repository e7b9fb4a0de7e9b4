#![cfg(unix)]

use std::io::Write;
use std::time::{Duration, Instant};

use controlpanel_lib::config::PanelConfig;
use controlpanel_lib::error::SupervisorError;
use controlpanel_lib::events::SupervisorEvent;
use controlpanel_lib::process::{ServiceState, StopOutcome};
use controlpanel_lib::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use controlpanel_lib::supervisor::{Supervisor, SupervisorOptions};

fn config_file(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

/// Three shell services, one of which ignores SIGTERM
fn supervisor_from_file(auto_start: &str, grace_secs: &str) -> Supervisor {
    let json = format!(
        r#"{{
            "microservices": "auth, data, stubborn",
            "auto_start": "{}",
            "grace_period_secs": {},
            "max_workers": 4,
            "commands": {{
                "auth": ["sh", "-c", "exec sleep 30"],
                "data": ["sh", "-c", "exec sleep 30"],
                "stubborn": ["sh", "-c", "trap '' TERM; sleep 30"]
            }}
        }}"#,
        auto_start, grace_secs
    );
    let file = config_file(&json);
    let config = PanelConfig::load(Some(file.path())).unwrap();

    Supervisor::new(
        config.catalog().unwrap(),
        SupervisorOptions {
            grace_period: config.grace_period().unwrap(),
            max_workers: config.max_workers().unwrap(),
            ..SupervisorOptions::default()
        },
    )
}

#[tokio::test]
async fn start_then_stop_round_trip() {
    let supervisor = supervisor_from_file("", "2");

    let pid = supervisor.start_service("auth").await.unwrap();
    assert!(pid > 0);
    assert_eq!(supervisor.state("auth"), ServiceState::Running);

    let again = supervisor.start_service("auth").await.unwrap_err();
    assert!(matches!(again, SupervisorError::AlreadyRunning(_)));

    let outcome = supervisor.stop_service("auth").await.unwrap();
    assert!(matches!(outcome, StopOutcome::Graceful(_)));
    assert_eq!(supervisor.state("auth"), ServiceState::Stopped);

    let again = supervisor.stop_service("auth").await.unwrap_err();
    assert!(matches!(again, SupervisorError::NotRunning(_)));
}

#[tokio::test]
async fn auto_start_runs_listed_services_only() {
    let supervisor = supervisor_from_file("auth,data", "2");

    assert!(supervisor.auto_start().await.is_empty());

    let mut running: Vec<String> = supervisor
        .snapshot()
        .into_iter()
        .filter(|info| info.state == ServiceState::Running)
        .map(|info| info.name)
        .collect();
    running.sort();
    assert_eq!(running, vec!["auth".to_string(), "data".to_string()]);
    assert!(!supervisor.is_running("stubborn"));

    assert!(supervisor.stop_all().await.is_empty());
    assert!(supervisor.registry().is_empty());
}

#[tokio::test]
async fn stubborn_service_is_force_killed_within_bound() {
    let supervisor = supervisor_from_file("", "0.3");
    supervisor.start_service("stubborn").await.unwrap();
    // Give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut events = supervisor.events().subscribe();
    let started = Instant::now();
    let outcome = supervisor.stop_service("stubborn").await.unwrap();

    assert!(outcome.was_forced());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!supervisor.is_running("stubborn"));

    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::ServiceStateChanged {
            new_state: ServiceState::Stopped,
            ..
        } = event
        {
            saw_stopped = true;
        }
    }
    assert!(saw_stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_runs_once_and_reports_completion() {
    let supervisor = supervisor_from_file("auth,data,stubborn", "0.3");
    assert!(supervisor.auto_start().await.is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut events = supervisor.events().subscribe();
    let coordinator = ShutdownCoordinator::new(supervisor.clone());

    let report = match coordinator.shutdown_all().await {
        ShutdownOutcome::Completed(report) => report,
        other => panic!("unexpected {:?}", other),
    };
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 3);
    assert!(supervisor.registry().is_empty());

    assert_eq!(
        coordinator.shutdown_all().await,
        ShutdownOutcome::AlreadyInProgress
    );
    assert_eq!(coordinator.wait_completed().await, report);

    let mut started = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SupervisorEvent::ShutdownStarted => started += 1,
            SupervisorEvent::ShutdownCompleted { failures } => {
                assert!(failures.is_empty());
                completed += 1;
            }
            _ => {}
        }
    }
    assert_eq!((started, completed), (1, 1));

    let refused = supervisor.start_service("auth").await.unwrap_err();
    assert!(matches!(refused, SupervisorError::ShuttingDown(_)));
}
