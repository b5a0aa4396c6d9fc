//! Shelf system traits and core types
//!
//! Defines the service lifecycle state machine, the descriptor a service is
//! registered with, the traits hosted services and their bootstrappers
//! implement, and the error taxonomy shared by every layer of the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::shelf::channel::protocol::{FaultReport, FaultStage, LifecycleCommand};

/// Lifecycle state of a hosted service as tracked by its controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    /// No worker exists (initial and final state)
    Unloaded,
    /// Worker is being constructed behind its isolation boundary
    Creating,
    /// Worker exists but has not been started
    Created,
    /// Start command sent, waiting for acknowledgment
    Starting,
    /// Worker acknowledged start or continue
    Running,
    /// Pause command sent
    Pausing,
    /// Worker acknowledged pause
    Paused,
    /// Continue command sent
    Continuing,
    /// Stop command sent
    Stopping,
    /// Worker acknowledged stop
    Stopped,
    /// Unload in progress
    Unloading,
    /// Worker reported an unrecoverable error
    Faulted,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Unloaded => "unloaded",
            ServiceState::Creating => "creating",
            ServiceState::Created => "created",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Pausing => "pausing",
            ServiceState::Paused => "paused",
            ServiceState::Continuing => "continuing",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Unloading => "unloading",
            ServiceState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Isolation boundary a service runs behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Worker runs inside the host process in its own task with contained panics
    #[default]
    Sandboxed,
    /// Worker runs in a separate OS process connected over a Unix socket
    ExternalProcess,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Sandboxed => f.write_str("sandboxed"),
            IsolationLevel::ExternalProcess => f.write_str("external-process"),
        }
    }
}

/// Immutable description of one hosted service
///
/// Created once at registration time and shared (behind an `Arc`) by the
/// controller and its isolation references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service name (unique key within a coordinator)
    pub name: String,
    /// Isolation boundary for the worker
    pub isolation: IsolationLevel,
    /// Bootstrapper id used to construct the worker's entry point
    ///
    /// When absent the service name is used as the lookup key.
    pub bootstrapper: Option<String>,
    /// Auxiliary module ids preloaded into the worker before its entry point runs
    pub modules: Vec<String>,
    /// Working directory for the worker
    pub working_dir: PathBuf,
}

impl ServiceDescriptor {
    /// Create a descriptor with no bootstrapper, no modules and the current directory
    pub fn new(name: impl Into<String>, isolation: IsolationLevel) -> Self {
        Self {
            name: name.into(),
            isolation,
            bootstrapper: None,
            modules: Vec::new(),
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_bootstrapper(mut self, bootstrapper: impl Into<String>) -> Self {
        self.bootstrapper = Some(bootstrapper.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.push(module.into());
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// Key used to resolve the worker's bootstrapper
    pub fn bootstrapper_key(&self) -> &str {
        self.bootstrapper.as_deref().unwrap_or(&self.name)
    }
}

/// Everything a bootstrapper is handed when constructing a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfContext {
    /// Name of the service being constructed
    pub service_name: String,
    /// Working directory of the worker
    pub working_dir: PathBuf,
    /// Modules preloaded before the entry point runs
    pub modules: Vec<String>,
}

impl ShelfContext {
    /// Whether a module was preloaded into this worker
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }
}

/// A hosted unit of work
///
/// Implemented by the code that runs inside the isolation boundary. Errors
/// and panics raised from these hooks never cross the boundary; the worker
/// converts them into fault messages.
#[async_trait]
pub trait Service: Send {
    /// Begin processing
    async fn on_start(&mut self) -> anyhow::Result<()>;

    /// Stop processing (graceful)
    async fn on_stop(&mut self) -> anyhow::Result<()>;

    /// Suspend processing without releasing resources
    async fn on_pause(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Resume after a pause
    async fn on_continue(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources before the worker is torn down
    async fn on_unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a service's entry point inside its isolation boundary
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Construct the service
    async fn bootstrap(&self, context: ShelfContext) -> anyhow::Result<Box<dyn Service>>;
}

/// Shelf system errors
#[derive(Debug, Error)]
pub enum ShelfError {
    #[error(
        "failed to create worker for service '{service}' (bootstrapper: {})",
        .bootstrapper.as_deref().unwrap_or("default")
    )]
    WorkerCreation {
        service: String,
        bootstrapper: Option<String>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("isolation reference for service '{0}' is unavailable")]
    ReferenceUnavailable(String),

    #[error("one or more services failed to {operation} in a timely manner")]
    LifecycleTimeout {
        operation: LifecycleCommand,
        #[source]
        source: Option<Fault>,
    },

    #[error("all services have errored out while trying to {operation}")]
    AllServicesFailed {
        operation: LifecycleCommand,
        #[source]
        source: Option<Fault>,
    },

    #[error("service '{service}' failed during {stage}")]
    WorkerFault {
        service: String,
        stage: FaultStage,
        #[source]
        source: FaultReport,
    },

    #[error("worker for service '{service}' exited unexpectedly: {status}")]
    WorkerExited { service: String, status: String },

    #[error(transparent)]
    Remote(#[from] FaultReport),

    #[error("endpoint '{0}' is closed")]
    EndpointClosed(String),

    #[error("endpoint '{endpoint}' already has a handler for {route}")]
    DuplicateHandler { endpoint: String, route: String },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    #[error("unknown bootstrapper: {0}")]
    UnknownBootstrapper(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IPC communication error: {0}")]
    Ipc(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShelfError {
    /// Wrap a construction failure for `service`
    pub fn creation(
        service: impl Into<String>,
        bootstrapper: Option<String>,
        source: ShelfError,
    ) -> Self {
        ShelfError::WorkerCreation {
            service: service.into(),
            bootstrapper,
            source: Box::new(source),
        }
    }
}

impl From<bincode::Error> for ShelfError {
    fn from(e: bincode::Error) -> Self {
        ShelfError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ShelfError {
    fn from(e: serde_json::Error) -> Self {
        ShelfError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for ShelfError {
    fn from(e: toml::de::Error) -> Self {
        ShelfError::Config(e.to_string())
    }
}

/// A fault observed by the host, attributed to one service
///
/// Cheap to clone; the fault queue and the fault subscriber see the same error.
#[derive(Debug, Clone, Error)]
#[error("service '{service_name}' faulted: {error}")]
pub struct Fault {
    pub service_name: String,
    #[source]
    pub error: Arc<ShelfError>,
}

impl Fault {
    pub fn new(service_name: impl Into<String>, error: ShelfError) -> Self {
        Self {
            service_name: service_name.into(),
            error: Arc::new(error),
        }
    }

    /// Rebuild a typed error from a fault report that crossed a boundary
    pub fn from_report(service_name: &str, report: FaultReport) -> Self {
        let error = match report.stage {
            FaultStage::Creation => ShelfError::WorkerCreation {
                service: service_name.to_string(),
                bootstrapper: report.bootstrapper.clone(),
                source: Box::new(report),
            },
            FaultStage::Exited => ShelfError::WorkerExited {
                service: service_name.to_string(),
                status: report.message,
            },
            stage => ShelfError::WorkerFault {
                service: service_name.to_string(),
                stage,
                source: report,
            },
        };
        Self::new(service_name, error)
    }
}
