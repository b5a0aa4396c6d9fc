//! Worker process spawning
//!
//! Launches the host executable in `shelf` mode for one service, hands it the
//! socket to connect back to, and waits for the worker to announce itself.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::shelf::ipc::link::FrameLink;
use crate::shelf::ipc::server::ShelfIpcListener;
use crate::shelf::process::limits::ResourceLimits;
use crate::shelf::traits::{ServiceDescriptor, ShelfError};

/// Spawns worker processes
#[derive(Debug, Clone)]
pub struct ShelfProcessSpawner {
    /// Executable launched for each worker
    pub executable: PathBuf,
    /// Directory holding the per-worker IPC sockets
    pub socket_dir: PathBuf,
    /// Limits applied to every worker
    limits: Option<ResourceLimits>,
}

/// A worker process that has connected and announced itself
pub struct SpawnedShelf {
    pub child: Child,
    pub link: FrameLink,
    /// Address the worker reported
    pub address: String,
    /// Channel name the worker reported
    pub channel_name: String,
}

impl ShelfProcessSpawner {
    /// Create a new spawner
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(executable: P, socket_dir: Q) -> Self {
        Self {
            executable: executable.as_ref().to_path_buf(),
            socket_dir: socket_dir.as_ref().to_path_buf(),
            limits: None,
        }
    }

    /// Spawner that relaunches the running executable
    pub fn current_exe<P: AsRef<Path>>(socket_dir: P) -> Result<Self, ShelfError> {
        Ok(Self::new(std::env::current_exe()?, socket_dir))
    }

    /// Apply resource limits to spawned workers
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        if !limits.is_empty() {
            self.limits = Some(limits);
        }
        self
    }

    pub fn limits(&self) -> Option<&ResourceLimits> {
        self.limits.as_ref()
    }

    /// Spawn a worker for `descriptor` and wait until it is listening
    ///
    /// The child is killed if it exits, faults or stays silent before
    /// announcing itself within `create_timeout`.
    pub async fn spawn(
        &self,
        descriptor: &ServiceDescriptor,
        modules: &[String],
        create_timeout: Duration,
    ) -> Result<SpawnedShelf, ShelfError> {
        let channel_name = format!("{}-{}", descriptor.name, Uuid::new_v4().simple());
        let socket_path = self.socket_dir.join(format!("{}.sock", channel_name));
        info!(
            "Spawning worker process for service {} on {:?}",
            descriptor.name, socket_path
        );

        let listener = ShelfIpcListener::bind(&socket_path)?;

        let mut command = Command::new(&self.executable);
        command
            .arg("shelf")
            .arg("--uri")
            .arg(&socket_path)
            .arg("--pipe")
            .arg(&channel_name)
            .arg("--service-name")
            .arg(&descriptor.name);
        if let Some(bootstrapper) = &descriptor.bootstrapper {
            command.arg("--bootstrapper").arg(bootstrapper);
        }
        for module in modules {
            command.arg("--module").arg(module);
        }
        command
            .current_dir(&descriptor.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        if let Some(limits) = self.limits {
            // SAFETY: the closure only calls setrlimit, which is async-signal-safe
            unsafe {
                command.pre_exec(move || limits.apply_to_current_process());
            }
        }

        debug!("Spawning process: {:?}", command);
        let mut child = command.spawn().map_err(|e| {
            ShelfError::Ipc(format!(
                "Failed to spawn worker process {:?}: {}",
                self.executable, e
            ))
        })?;

        let handshake = timeout(
            create_timeout,
            Self::handshake(&listener, &mut child, &descriptor.name),
        )
        .await;

        let (link, address, reported_channel) = match handshake {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                Self::reap(&mut child, &descriptor.name).await;
                return Err(e);
            }
            Err(_) => {
                Self::reap(&mut child, &descriptor.name).await;
                return Err(ShelfError::Timeout(format!(
                    "worker for service '{}' to start listening",
                    descriptor.name
                )));
            }
        };

        info!(
            "Worker for service {} listening at {} (pid {:?})",
            descriptor.name,
            address,
            child.id()
        );
        Ok(SpawnedShelf {
            child,
            link,
            address,
            channel_name: reported_channel,
        })
    }

    async fn handshake(
        listener: &ShelfIpcListener,
        child: &mut Child,
        service_name: &str,
    ) -> Result<(FrameLink, String, String), ShelfError> {
        let mut link = tokio::select! {
            accepted = listener.accept() => accepted?,
            status = child.wait() => {
                return Err(ShelfError::WorkerExited {
                    service: service_name.to_string(),
                    status: describe_exit(status),
                });
            }
        };
        let (address, channel_name) = link.await_listening().await?;
        Ok((link, address, channel_name))
    }

    async fn reap(child: &mut Child, service_name: &str) {
        if let Err(e) = child.start_kill() {
            debug!("Worker for {} already gone: {}", service_name, e);
        }
        if let Err(e) = child.wait().await {
            warn!("Failed to reap worker for {}: {}", service_name, e);
        }
    }
}

/// Human-readable exit description
pub fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown exit status ({})", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shelf::traits::IsolationLevel;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let temp_dir = TempDir::new().unwrap();
        let spawner = ShelfProcessSpawner::new(
            temp_dir.path().join("does-not-exist"),
            temp_dir.path().join("sockets"),
        );
        let descriptor = ServiceDescriptor::new("clock", IsolationLevel::ExternalProcess);

        let result = spawner
            .spawn(&descriptor, &[], Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(ShelfError::Ipc(_))));
    }

    #[tokio::test]
    async fn test_early_exit_reported_before_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let spawner = ShelfProcessSpawner::new("false", temp_dir.path().join("sockets"));
        let descriptor = ServiceDescriptor::new("clock", IsolationLevel::ExternalProcess);

        let result = spawner
            .spawn(&descriptor, &[], Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(ShelfError::WorkerExited { .. })));
    }

    #[test]
    fn test_empty_limits_not_applied() {
        let spawner = ShelfProcessSpawner::new("/bin/true", "/tmp")
            .with_limits(ResourceLimits::default());
        assert!(spawner.limits().is_none());
    }
}
