pub mod app;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod process;
pub mod shutdown;
pub mod supervisor;

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use cli::Cli;
use config::PanelConfig;
use events::{EventBus, OperationPhase};
use process::Launcher;
use shutdown::ShutdownCoordinator;
use supervisor::{Supervisor, SupervisorOptions};

/// How long the runtime may take to unwind once the panel is done
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the status log may take to print the final shutdown lines
const STATUS_LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = PanelConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level()?)
        .init();

    info!("Starting {} v{}", config.app_name, config.app_version);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let result = runtime.block_on(run_panel(config));
    // The console may still be parked on a blocking stdin read
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run_panel(config: PanelConfig) -> anyhow::Result<()> {
    let events = EventBus::new();
    let status_log = console::spawn_status_log(events.subscribe());

    events.progress("Loading application configuration...");
    let catalog = config.catalog()?;
    let options = SupervisorOptions {
        grace_period: config.grace_period()?,
        max_workers: config.max_workers()?,
        launcher: Launcher::new(),
        events: events.clone(),
    };

    events.progress("Setting up microservices...");
    report_missing_services(&config, Path::new("."), &events);
    let supervisor = Supervisor::new(catalog, options);
    shutdown::install_panic_hook(supervisor.registry());
    let coordinator = ShutdownCoordinator::new(supervisor.clone());

    events.progress("Finalizing setup...");
    events.progress("Application ready!");

    let auto_start = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let failures = supervisor.auto_start().await;
            if !failures.is_empty() {
                warn!("Auto-start finished with {} failures", failures.len());
            }
        })
    };

    let termination = async {
        match shutdown::termination_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to listen for termination signals: {}", e);
                std::future::pending().await
            }
        }
    };

    tokio::select! {
        result = console::run_console(supervisor.clone()) => match result {
            Ok(()) => info!("Console closed, shutting down"),
            Err(e) => error!("Console input failed: {}, shutting down", e),
        },
        signal = termination => info!("Received {}, shutting down", signal),
    }

    auto_start.abort();
    let report = coordinator.shutdown_and_wait().await;

    if tokio::time::timeout(STATUS_LOG_DRAIN_TIMEOUT, status_log)
        .await
        .is_err()
    {
        warn!("Status log did not drain in time");
    }

    if !report.is_clean() {
        warn!(
            "{} services could not be stopped cleanly",
            report.failures.len()
        );
    }
    Ok(())
}

/// Flag configured service scripts that are not on disk. The panel still
/// comes up; starting such a service will fail on its own.
fn report_missing_services(config: &PanelConfig, base: &Path, events: &EventBus) -> Vec<String> {
    let missing = config.missing_service_files(base);
    if missing.is_empty() {
        return missing;
    }

    warn!("Missing microservice files: {:?}", missing);
    for name in &missing {
        events.failed(
            name,
            OperationPhase::Start,
            format!("microservice file {:?} not found", base.join(name)),
        );
    }
    events.progress(format!(
        "Some microservice files are missing: {}",
        missing.join(", ")
    ));
    missing
}
