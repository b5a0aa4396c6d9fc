//! Inter-process communication for isolated workers
//!
//! Both isolation variants talk through a `FrameLink`; external-process
//! workers run it over a Unix domain socket.

pub mod link;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

pub use link::{FrameLink, FrameReceiver, FrameSender};
