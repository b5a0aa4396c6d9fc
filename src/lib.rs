//! Shelf Host - supervised hosting of isolated services
//!
//! Hosts one or more services inside a supervising process. Each service runs
//! behind its own isolation boundary, either a sandboxed task inside the host
//! or a separate worker process, so a faulting service cannot take down the
//! host or its siblings.
//!
//! ## Architecture
//!
//! 1. Coordinator: drives the collective lifecycle and collects faults
//! 2. Controllers: one state machine per service
//! 3. Isolation references: own the worker and its channel
//! 4. Workers: run the service and answer lifecycle commands
//!
//! Every layer talks through mailboxes; only encoded frames cross a boundary.

pub mod config;
pub mod shelf;
pub mod utils;

pub use config::HostConfig;
pub use shelf::{
    BootstrapperRegistry, ServiceCoordinator, ServiceDescriptor, ServiceState, ShelfError,
};
