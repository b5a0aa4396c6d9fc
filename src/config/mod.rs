//! Configuration management for shelf-host
//!
//! Handles loading the host configuration from TOML or JSON, validating the
//! service list, and turning it into controller factories and isolation
//! settings for the coordinator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::shelf::controller::{ControllerFactory, ServiceController};
use crate::shelf::isolation::IsolationSettings;
#[cfg(unix)]
use crate::shelf::process::spawner::ShelfProcessSpawner;
use crate::shelf::process::ResourceLimits;
use crate::shelf::registry::BootstrapperRegistry;
use crate::shelf::traits::{IsolationLevel, ServiceDescriptor, ShelfError};

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "shelf_host=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Time a collective lifecycle transition may take
    #[serde(default = "default_transition_timeout_secs")]
    pub transition_timeout_secs: u64,

    /// Time a worker gets to build its service and announce itself
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    /// Time a worker gets to acknowledge an unload request
    #[serde(default = "default_unload_timeout_secs")]
    pub unload_timeout_secs: u64,

    /// Directory for worker IPC sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// Executable launched for external-process workers (defaults to this binary)
    #[serde(default)]
    pub worker_executable: Option<String>,
}

fn default_transition_timeout_secs() -> u64 {
    60
}

fn default_create_timeout_secs() -> u64 {
    30
}

fn default_unload_timeout_secs() -> u64 {
    10
}

fn default_socket_dir() -> String {
    "data/shelves/sockets".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            transition_timeout_secs: default_transition_timeout_secs(),
            create_timeout_secs: default_create_timeout_secs(),
            unload_timeout_secs: default_unload_timeout_secs(),
            socket_dir: default_socket_dir(),
            worker_executable: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }
}

/// One hosted service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,

    #[serde(default)]
    pub isolation: IsolationLevel,

    /// Bootstrapper id (defaults to the service name)
    #[serde(default)]
    pub bootstrapper: Option<String>,

    /// Modules preloaded into the worker
    #[serde(default)]
    pub modules: Vec<String>,

    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

impl ServiceConfig {
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.clone(),
            isolation: self.isolation,
            bootstrapper: self.bootstrapper.clone(),
            modules: self.modules.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: Option<LoggingConfig>,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Limits applied to every external-process worker
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl HostConfig {
    /// Load configuration from a TOML file, or JSON when the extension is `.json`
    pub fn from_file(path: &Path) -> Result<Self, ShelfError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: HostConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn to_json_file(&self, path: &Path) -> Result<(), ShelfError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject empty and duplicate service names
    pub fn validate(&self) -> Result<(), ShelfError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ShelfError::Config("service name must not be empty".to_string()));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ShelfError::DuplicateService(service.name.clone()));
            }
            #[cfg(not(unix))]
            if service.isolation == IsolationLevel::ExternalProcess {
                return Err(ShelfError::Config(format!(
                    "service '{}': external-process isolation requires a unix host",
                    service.name
                )));
            }
        }
        Ok(())
    }

    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services.iter().map(ServiceConfig::descriptor).collect()
    }

    /// One controller factory per configured service, in configuration order
    pub fn controller_factories(&self) -> Vec<ControllerFactory> {
        self.descriptors()
            .into_iter()
            .map(ServiceController::factory)
            .collect()
    }

    /// Configured limits this build cannot apply, if any
    pub fn unenforced_limits(&self) -> Option<ResourceLimits> {
        self.resource_limits
            .filter(|limits| !limits.is_empty() && !ResourceLimits::ENFORCEABLE)
    }

    /// Isolation settings for a coordinator hosting this configuration
    pub fn isolation_settings(
        &self,
        registry: BootstrapperRegistry,
    ) -> Result<IsolationSettings, ShelfError> {
        if let Some(limits) = self.unenforced_limits() {
            warn!(
                "Resource limits {:?} are configured but this build cannot apply them; \
                 worker processes will run unrestricted",
                limits
            );
        }
        let registry = Arc::new(registry);

        #[cfg(unix)]
        let settings = {
            let spawner = match &self.coordinator.worker_executable {
                Some(executable) => {
                    ShelfProcessSpawner::new(executable, &self.coordinator.socket_dir)
                }
                None => ShelfProcessSpawner::current_exe(&self.coordinator.socket_dir)?,
            };
            let spawner = match self.resource_limits {
                Some(limits) => spawner.with_limits(limits),
                None => spawner,
            };
            IsolationSettings::new(registry, Arc::new(spawner))
        };
        #[cfg(not(unix))]
        let settings = IsolationSettings::new(registry);

        Ok(settings
            .with_create_timeout(self.coordinator.create_timeout())
            .with_unload_timeout(self.coordinator.unload_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[logging]
filter = "debug"

[coordinator]
transition_timeout_secs = 5
socket_dir = "/tmp/shelves"

[resource_limits]
max_file_descriptors = 128

[[services]]
name = "clock"
bootstrapper = "heartbeat"

[[services]]
name = "crier"
isolation = "external_process"
bootstrapper = "heartbeat"
modules = ["fast-tick"]
working_dir = "/tmp"
"#;

    #[test]
    fn test_parse_toml_with_defaults() {
        let config: HostConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.coordinator.transition_timeout(), Duration::from_secs(5));
        assert_eq!(config.coordinator.create_timeout_secs, 30);
        assert_eq!(config.coordinator.unload_timeout_secs, 10);
        assert_eq!(
            config.resource_limits.unwrap().max_file_descriptors,
            Some(128)
        );

        let descriptors = config.descriptors();
        assert_eq!(descriptors[0].isolation, IsolationLevel::Sandboxed);
        assert_eq!(descriptors[0].working_dir, PathBuf::from("."));
        assert_eq!(descriptors[1].isolation, IsolationLevel::ExternalProcess);
        assert_eq!(descriptors[1].modules, vec!["fast-tick".to_string()]);
        assert_eq!(config.controller_factories().len(), 2);
    }

    #[test]
    fn test_unenforced_limits_reported() {
        let config: HostConfig = toml::from_str(SAMPLE).unwrap();
        if ResourceLimits::ENFORCEABLE {
            assert_eq!(config.unenforced_limits(), None);
        } else {
            assert_eq!(config.unenforced_limits(), config.resource_limits);
        }

        let unlimited: HostConfig = toml::from_str("[resource_limits]\n").unwrap();
        assert_eq!(unlimited.unenforced_limits(), None);
        assert_eq!(HostConfig::default().unenforced_limits(), None);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config: HostConfig = toml::from_str(
            r#"
[[services]]
name = "clock"

[[services]]
name = "clock"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ShelfError::DuplicateService(name)) if name == "clock"
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let config: HostConfig = toml::from_str("[[services]]\nname = \"  \"\n").unwrap();
        assert!(matches!(config.validate(), Err(ShelfError::Config(_))));
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("host.json");
        let config: HostConfig = toml::from_str(SAMPLE).unwrap();

        config.to_json_file(&path).unwrap();
        let loaded = HostConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_file_reports_bad_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("host.toml");
        std::fs::write(&path, "services = 3").unwrap();

        assert!(matches!(
            HostConfig::from_file(&path),
            Err(ShelfError::Config(_))
        ));
    }
}
