use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, ConfigError, PanelConfig};

#[derive(Debug, Parser)]
#[command(name = "controlpanel", version, about = "Start, stop and monitor local microservices")]
pub struct Cli {
    /// Path to a JSON configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Override the graceful stop window, in seconds
    #[arg(long = "grace-period")]
    pub grace_period: Option<f64>,

    /// Skip the auto-start sweep
    #[arg(long = "no-auto-start", action = clap::ArgAction::SetTrue)]
    pub no_auto_start: bool,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration
    pub fn apply(&self, config: &mut PanelConfig) -> Result<(), ConfigError> {
        if let Some(level) = &self.log_level {
            config::parse_level(level)?;
            config.log_level = level.clone();
        }
        if let Some(secs) = self.grace_period {
            config.grace_period_secs = secs.to_string();
            config.grace_period()?;
        }
        if self.no_auto_start {
            config.auto_start.clear();
        }
        Ok(())
    }
}
