use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, Level};

use crate::app::{APP_ID, APP_NAME, APP_VERSION, CONFIG_ENV_VAR, CONFIG_FILE_NAME};

const DEFAULT_MICROSERVICES: &str =
    "auth_service.py,data_service.py,api_service.py,notification_service.py,logging_service.py";
const DEFAULT_AUTO_START: &str = "auth_service.py,data_service.py";
const DEFAULT_INTERPRETER: &str = "python3";
const DEFAULT_GRACE_PERIOD_SECS: f64 = 5.0;
const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no microservices configured")]
    NoServices,
    #[error("microservice {0} is listed more than once")]
    DuplicateService(String),
    #[error("command override for {0} is empty")]
    EmptyCommand(String),
    #[error("unknown log level {0:?}")]
    InvalidLogLevel(String),
    #[error("max_workers must be at least 1")]
    InvalidMaxWorkers,
    #[error("grace_period_secs must be a non-negative number, got {0}")]
    InvalidGracePeriod(String),
}

/// Executable invocation for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Static definition of one launchable service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub command: CommandSpec,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

/// The resolved, ordered service set and its auto-start subset.
/// Immutable once handed to the supervisor.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    descriptors: Vec<ServiceDescriptor>,
    auto_start: Vec<String>,
}

impl ServiceCatalog {
    /// Builds a catalog, rejecting duplicate names.
    /// Auto-start names are kept as given; unknown ones surface during the sweep.
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        auto_start: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.name.as_str()) {
                return Err(ConfigError::DuplicateService(descriptor.name.clone()));
            }
        }
        Ok(Self {
            descriptors,
            auto_start,
        })
    }

    pub fn service_descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    pub fn auto_start_names(&self) -> &[String] {
        &self.auto_start
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Flat key/value application configuration.
///
/// Values may be given as JSON strings or numbers; lists are comma-separated
/// strings, e.g. `"microservices": "auth_service.py,data_service.py"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub app_name: String,
    pub app_version: String,
    pub microservices: String,
    pub auto_start: String,
    pub log_level: String,
    #[serde(deserialize_with = "string_or_number")]
    pub max_workers: String,
    /// Program used to run each service entry; empty runs the entry itself
    pub interpreter: String,
    #[serde(deserialize_with = "string_or_number")]
    pub grace_period_secs: String,
    /// Per-service command overrides: name -> [program, args...]
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            app_version: APP_VERSION.to_string(),
            microservices: DEFAULT_MICROSERVICES.to_string(),
            auto_start: DEFAULT_AUTO_START.to_string(),
            log_level: "INFO".to_string(),
            max_workers: DEFAULT_MAX_WORKERS.to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS.to_string(),
            commands: BTreeMap::new(),
        }
    }
}

impl PanelConfig {
    /// Load configuration from an explicit path, the environment, or the
    /// per-user config directory, falling back to built-in defaults when no
    /// file exists at the implicit locations.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Self::from_file(Path::new(path.trim()));
            }
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = Self::from_json_str(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn service_names(&self) -> Vec<String> {
        split_list(&self.microservices)
    }

    pub fn auto_start_names(&self) -> Vec<String> {
        split_list(&self.auto_start)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        parse_level(&self.log_level)
    }

    pub fn max_workers(&self) -> Result<usize, ConfigError> {
        match self.max_workers.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::InvalidMaxWorkers),
        }
    }

    pub fn grace_period(&self) -> Result<Duration, ConfigError> {
        let raw = self.grace_period_secs.trim();
        raw.parse::<f64>()
            .ok()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| ConfigError::InvalidGracePeriod(raw.to_string()))
    }

    /// Resolve the launch command for one configured entry
    pub fn command_for(&self, name: &str) -> Result<CommandSpec, ConfigError> {
        if let Some(parts) = self.commands.get(name) {
            let (program, args) = parts
                .split_first()
                .ok_or_else(|| ConfigError::EmptyCommand(name.to_string()))?;
            return Ok(CommandSpec {
                program: program.clone(),
                args: args.to_vec(),
            });
        }

        let interpreter = self.interpreter.trim();
        if interpreter.is_empty() {
            Ok(CommandSpec::new(name, &[]))
        } else {
            Ok(CommandSpec::new(interpreter, &[name]))
        }
    }

    /// Entries run through the interpreter whose script is missing under `base`.
    /// Services with a command override or no interpreter are not checked.
    pub fn missing_service_files(&self, base: &Path) -> Vec<String> {
        if self.interpreter.trim().is_empty() {
            return Vec::new();
        }
        self.service_names()
            .into_iter()
            .filter(|name| !self.commands.contains_key(name))
            .filter(|name| !base.join(name).exists())
            .collect()
    }

    /// Resolve the service descriptor set handed to the supervisor
    pub fn catalog(&self) -> Result<ServiceCatalog, ConfigError> {
        let names = self.service_names();
        if names.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let descriptors = names
            .iter()
            .map(|name| Ok(ServiceDescriptor::new(name.clone(), self.command_for(name)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        ServiceCatalog::new(descriptors, self.auto_start_names())
    }
}

/// Per-user configuration file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_ID).join(CONFIG_FILE_NAME))
}

/// Split a comma-separated list, trimming entries and dropping empty ones
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_level(raw: &str) -> Result<Level, ConfigError> {
    raw.trim()
        .parse::<Level>()
        .map_err(|_| ConfigError::InvalidLogLevel(raw.to_string()))
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" a.py, b.py ,,c.py, "),
            vec!["a.py".to_string(), "b.py".to_string(), "c.py".to_string()]
        );
        assert!(split_list("").is_empty());
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn test_default_catalog_matches_builtin_services() {
        let config = PanelConfig::default();
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 5);
        assert_eq!(
            catalog.auto_start_names(),
            &["auth_service.py".to_string(), "data_service.py".to_string()]
        );

        let auth = catalog.get("auth_service.py").unwrap();
        assert_eq!(auth.command, CommandSpec::new("python3", &["auth_service.py"]));
        assert_eq!(config.grace_period().unwrap(), Duration::from_secs(5));
        assert_eq!(config.max_workers().unwrap(), 8);
        assert_eq!(config.log_level().unwrap(), Level::INFO);
    }

    #[test]
    fn test_parse_string_and_number_values() {
        let config = PanelConfig::from_json_str(
            r#"{
                "app_name": "Panel",
                "microservices": "a, b",
                "auto_start": "a",
                "max_workers": "3",
                "grace_period_secs": 0.5,
                "log_level": "debug",
                "interpreter": "",
                "commands": { "b": ["sleep", "30"] }
            }"#,
        )
        .unwrap();

        assert_eq!(config.app_name, "Panel");
        assert_eq!(config.max_workers().unwrap(), 3);
        assert_eq!(config.grace_period().unwrap(), Duration::from_millis(500));
        assert_eq!(config.log_level().unwrap(), Level::DEBUG);

        let catalog = config.catalog().unwrap();
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(catalog.get("a").unwrap().command, CommandSpec::new("a", &[]));
        assert_eq!(catalog.get("b").unwrap().command, CommandSpec::new("sleep", &["30"]));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PanelConfig::default();
        config.microservices = "a,b,a".to_string();
        assert_eq!(
            config.catalog().unwrap_err(),
            ConfigError::DuplicateService("a".to_string())
        );

        config.microservices = " , ".to_string();
        assert_eq!(config.catalog().unwrap_err(), ConfigError::NoServices);

        config.microservices = "a".to_string();
        config.commands.insert("a".to_string(), vec![]);
        assert_eq!(
            config.catalog().unwrap_err(),
            ConfigError::EmptyCommand("a".to_string())
        );

        config.max_workers = "0".to_string();
        assert_eq!(config.max_workers().unwrap_err(), ConfigError::InvalidMaxWorkers);

        config.log_level = "chatty".to_string();
        assert!(config.log_level().is_err());

        config.grace_period_secs = "-1".to_string();
        assert!(config.grace_period().is_err());
    }

    #[test]
    fn test_auto_start_outside_set_is_not_a_load_error() {
        let mut config = PanelConfig::default();
        config.microservices = "a,b".to_string();
        config.auto_start = "a,zzz".to_string();
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.auto_start_names(), &["a".to_string(), "zzz".to_string()]);
        assert!(!catalog.contains("zzz"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "microservices": "x,y", "auto_start": "y" }}"#).unwrap();

        let config = PanelConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.service_names(), vec!["x".to_string(), "y".to_string()]);
        // Unspecified keys keep their defaults
        assert_eq!(config.interpreter, "python3");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PanelConfig::load(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_missing_service_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("auth_service.py"), "").unwrap();

        let mut config = PanelConfig::default();
        config.microservices = "auth_service.py, data_service.py, native".to_string();
        config
            .commands
            .insert("native".to_string(), vec!["sleep".to_string(), "30".to_string()]);

        assert_eq!(
            config.missing_service_files(dir.path()),
            vec!["data_service.py".to_string()]
        );

        config.interpreter = String::new();
        assert!(config.missing_service_files(dir.path()).is_empty());
    }
}
