//! Shelf message protocol
//!
//! Defines the lifecycle commands and status/fault events exchanged between
//! coordinator, controllers and workers. Every message carries the name of the
//! service it concerns and is encoded with bincode whenever it crosses an
//! isolation boundary, so no in-memory ownership ever leaks across.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shelf::channel::mailbox::Routed;
use crate::shelf::traits::{ServiceState, ShelfError};

/// Lifecycle commands the coordinator broadcasts to its services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleCommand {
    Start,
    Stop,
    Pause,
    Continue,
}

impl LifecycleCommand {
    /// Command message addressed to `service_name`
    pub fn to_message(self, service_name: impl Into<String>) -> ShelfMessage {
        let service_name = service_name.into();
        match self {
            LifecycleCommand::Start => ShelfMessage::StartService { service_name },
            LifecycleCommand::Stop => ShelfMessage::StopService { service_name },
            LifecycleCommand::Pause => ShelfMessage::PauseService { service_name },
            LifecycleCommand::Continue => ShelfMessage::ContinueService { service_name },
        }
    }

    /// Event a worker answers this command with
    pub fn expected_event(self) -> MessageKind {
        match self {
            LifecycleCommand::Start | LifecycleCommand::Continue => MessageKind::ServiceRunning,
            LifecycleCommand::Stop => MessageKind::ServiceStopped,
            LifecycleCommand::Pause => MessageKind::ServicePaused,
        }
    }

    /// Acknowledgment a worker sends after carrying out this command
    pub fn acknowledgment(self, service_name: impl Into<String>) -> ShelfMessage {
        let service_name = service_name.into();
        match self {
            LifecycleCommand::Start | LifecycleCommand::Continue => {
                ShelfMessage::ServiceRunning { service_name }
            }
            LifecycleCommand::Stop => ShelfMessage::ServiceStopped { service_name },
            LifecycleCommand::Pause => ShelfMessage::ServicePaused { service_name },
        }
    }

    /// State a controller settles in once the command is acknowledged
    pub fn target_state(self) -> ServiceState {
        match self {
            LifecycleCommand::Start | LifecycleCommand::Continue => ServiceState::Running,
            LifecycleCommand::Stop => ServiceState::Stopped,
            LifecycleCommand::Pause => ServiceState::Paused,
        }
    }

    /// State a controller holds between sending the command and the acknowledgment
    pub fn transitional_state(self) -> ServiceState {
        match self {
            LifecycleCommand::Start => ServiceState::Starting,
            LifecycleCommand::Stop => ServiceState::Stopping,
            LifecycleCommand::Pause => ServiceState::Pausing,
            LifecycleCommand::Continue => ServiceState::Continuing,
        }
    }

    /// Stage reported when the worker fails to carry out this command
    pub fn fault_stage(self) -> FaultStage {
        match self {
            LifecycleCommand::Start => FaultStage::Start,
            LifecycleCommand::Stop => FaultStage::Stop,
            LifecycleCommand::Pause => FaultStage::Pause,
            LifecycleCommand::Continue => FaultStage::Continue,
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleCommand::Start => f.write_str("start"),
            LifecycleCommand::Stop => f.write_str("stop"),
            LifecycleCommand::Pause => f.write_str("pause"),
            LifecycleCommand::Continue => f.write_str("continue"),
        }
    }
}

/// Why a service ended up unloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnloadReason {
    /// Worker acknowledged the unload request
    Requested,
    /// No worker existed when the unload was requested
    AlreadyUnloaded,
    /// A command could not be delivered because the worker is gone
    ReferenceUnavailable,
    /// The boundary had already been torn down when unload ran
    Unexpected,
    /// Worker never acknowledged the unload request and was released anyway
    TimedOut,
}

/// Lifecycle phase in which a worker failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultStage {
    Creation,
    Start,
    Stop,
    Pause,
    Continue,
    Unload,
    /// Worker exited or its channel closed without being asked to
    Exited,
}

impl fmt::Display for FaultStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultStage::Creation => "creation",
            FaultStage::Start => "start",
            FaultStage::Stop => "stop",
            FaultStage::Pause => "pause",
            FaultStage::Continue => "continue",
            FaultStage::Unload => "unload",
            FaultStage::Exited => "exit",
        };
        f.write_str(name)
    }
}

/// Serializable description of a failure that happened behind a boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub stage: FaultStage,
    pub message: String,
    /// Cause chain, outermost first
    pub causes: Vec<String>,
    /// Bootstrapper in use, for creation failures
    pub bootstrapper: Option<String>,
}

impl FaultReport {
    pub fn new(stage: FaultStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            causes: Vec::new(),
            bootstrapper: None,
        }
    }

    pub fn with_bootstrapper(mut self, bootstrapper: impl Into<String>) -> Self {
        self.bootstrapper = Some(bootstrapper.into());
        self
    }

    /// Capture an error and its source chain
    pub fn from_error(stage: FaultStage, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            stage,
            message: error.to_string(),
            causes,
            bootstrapper: None,
        }
    }

    pub fn from_anyhow(stage: FaultStage, error: &anyhow::Error) -> Self {
        Self {
            stage,
            message: error.to_string(),
            causes: error.chain().skip(1).map(|c| c.to_string()).collect(),
            bootstrapper: None,
        }
    }

    /// Report for a panic payload caught at the boundary
    pub fn panicked(stage: FaultStage, payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(stage, format!("worker panicked: {}", detail))
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for FaultReport {}

/// Main shelf message type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShelfMessage {
    // Commands: controller -> worker
    StartService {
        service_name: String,
    },
    StopService {
        service_name: String,
    },
    PauseService {
        service_name: String,
    },
    ContinueService {
        service_name: String,
    },
    UnloadService {
        service_name: String,
    },

    // Events: worker -> controller -> coordinator
    /// First message a worker sends once its channel is open
    WorkerListening {
        service_name: String,
        address: String,
        channel_name: String,
    },
    ServiceCreated {
        service_name: String,
    },
    ServiceRunning {
        service_name: String,
    },
    ServiceStopped {
        service_name: String,
    },
    ServicePaused {
        service_name: String,
    },
    /// Pre-unload notification published by the controller
    ServiceUnloading {
        service_name: String,
    },
    ServiceUnloaded {
        service_name: String,
        reason: UnloadReason,
    },
    /// Worker acknowledgment of an unload request
    WorkerUnloaded {
        service_name: String,
    },
    ServiceFault {
        service_name: String,
        fault: FaultReport,
    },
}

/// Message type classification, used for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    StartService,
    StopService,
    PauseService,
    ContinueService,
    UnloadService,
    WorkerListening,
    ServiceCreated,
    ServiceRunning,
    ServiceStopped,
    ServicePaused,
    ServiceUnloading,
    ServiceUnloaded,
    WorkerUnloaded,
    ServiceFault,
}

impl ShelfMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ShelfMessage::StartService { .. } => MessageKind::StartService,
            ShelfMessage::StopService { .. } => MessageKind::StopService,
            ShelfMessage::PauseService { .. } => MessageKind::PauseService,
            ShelfMessage::ContinueService { .. } => MessageKind::ContinueService,
            ShelfMessage::UnloadService { .. } => MessageKind::UnloadService,
            ShelfMessage::WorkerListening { .. } => MessageKind::WorkerListening,
            ShelfMessage::ServiceCreated { .. } => MessageKind::ServiceCreated,
            ShelfMessage::ServiceRunning { .. } => MessageKind::ServiceRunning,
            ShelfMessage::ServiceStopped { .. } => MessageKind::ServiceStopped,
            ShelfMessage::ServicePaused { .. } => MessageKind::ServicePaused,
            ShelfMessage::ServiceUnloading { .. } => MessageKind::ServiceUnloading,
            ShelfMessage::ServiceUnloaded { .. } => MessageKind::ServiceUnloaded,
            ShelfMessage::WorkerUnloaded { .. } => MessageKind::WorkerUnloaded,
            ShelfMessage::ServiceFault { .. } => MessageKind::ServiceFault,
        }
    }

    /// Service this message is routed for
    pub fn service_name(&self) -> &str {
        match self {
            ShelfMessage::StartService { service_name }
            | ShelfMessage::StopService { service_name }
            | ShelfMessage::PauseService { service_name }
            | ShelfMessage::ContinueService { service_name }
            | ShelfMessage::UnloadService { service_name }
            | ShelfMessage::WorkerListening { service_name, .. }
            | ShelfMessage::ServiceCreated { service_name }
            | ShelfMessage::ServiceRunning { service_name }
            | ShelfMessage::ServiceStopped { service_name }
            | ShelfMessage::ServicePaused { service_name }
            | ShelfMessage::ServiceUnloading { service_name }
            | ShelfMessage::ServiceUnloaded { service_name, .. }
            | ShelfMessage::WorkerUnloaded { service_name }
            | ShelfMessage::ServiceFault { service_name, .. } => service_name,
        }
    }

    /// Encode for transport across an isolation boundary
    pub fn encode(&self) -> Result<Bytes, ShelfError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ShelfError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Routed for ShelfMessage {
    type Route = MessageKind;

    fn route(&self) -> MessageKind {
        self.kind()
    }
}

/// A worker message tagged with the generation of the reference that forwarded it
///
/// Controllers bump the generation on every create so that late messages from
/// a worker that has already been replaced are recognised and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub generation: u64,
    pub message: ShelfMessage,
}
