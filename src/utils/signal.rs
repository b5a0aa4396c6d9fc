//! Shutdown signals for the hosting loop
//!
//! `shelf-host run` keeps its services up until the operator asks it to
//! stop. Workers never install these handlers; their host unloads them.

use std::fmt;
use tokio::signal;
use tracing::warn;

/// Which request ended the hosting loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, usually from a service manager
    Terminate,
    /// SIGINT or Ctrl+C
    Interrupt,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Wait until the host is asked to shut down
///
/// Falls back to Ctrl+C alone when the unix handlers cannot be installed.
pub async fn wait_for_shutdown_signal() -> ShutdownSignal {
    next_signal().await
}

#[cfg(unix)]
async fn next_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = signal(SignalKind::terminate())
        .and_then(|sigterm| signal(SignalKind::interrupt()).map(|sigint| (sigterm, sigint)));
    match handlers {
        Ok((mut sigterm, mut sigint)) => tokio::select! {
            _ = sigterm.recv() => ShutdownSignal::Terminate,
            _ = sigint.recv() => ShutdownSignal::Interrupt,
        },
        Err(e) => {
            warn!("Cannot install shutdown handlers, waiting for Ctrl+C: {}", e);
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn next_signal() -> ShutdownSignal {
    ctrl_c().await
}

async fn ctrl_c() -> ShutdownSignal {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
    }
    ShutdownSignal::Interrupt
}
