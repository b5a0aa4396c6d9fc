//! Shelf system
//!
//! Hosts services behind isolation boundaries and supervises their lifecycle.
//!
//! Layers, leaves first:
//! - `channel`: mailboxes and the message protocol
//! - `ipc`, `process`: frame links, sockets and worker processes
//! - `isolation`: references to workers behind a sandbox or process boundary
//! - `controller`: per-service state machine
//! - `coordinator`: collective lifecycle and fault aggregation

pub mod builtin;
pub mod channel;
pub mod controller;
pub mod coordinator;
pub mod faults;
pub mod ipc;
pub mod isolation;
pub mod process;
pub mod registry;
pub mod traits;
pub mod worker;

pub use channel::protocol::{
    FaultReport, FaultStage, LifecycleCommand, MessageKind, ShelfMessage, UnloadReason,
};
pub use controller::{ControllerContext, ControllerFactory, ServiceController};
pub use coordinator::{
    CoordinatorHooks, ServiceCoordinator, ServiceInfo, TransitionOutcome, TransitionVerdict,
};
pub use isolation::{IsolationReference, IsolationSettings, ReferenceInfo};
pub use registry::BootstrapperRegistry;
pub use traits::{
    Bootstrapper, Fault, IsolationLevel, Service, ServiceDescriptor, ServiceState, ShelfContext,
    ShelfError,
};
