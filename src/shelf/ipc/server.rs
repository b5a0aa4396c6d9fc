//! IPC listener for worker processes
//!
//! The host binds one socket per external-process worker and accepts exactly
//! the connection its child makes back.

use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::{debug, warn};

use crate::shelf::ipc::link::FrameLink;
use crate::shelf::traits::ShelfError;

/// Listening socket owned by the host for one worker
pub struct ShelfIpcListener {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl ShelfIpcListener {
    /// Bind `socket_path`, replacing a stale socket file if one is left over
    pub fn bind<P: AsRef<Path>>(socket_path: P) -> Result<Self, ShelfError> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                ShelfError::Ipc(format!(
                    "Failed to remove stale socket {:?}: {}",
                    socket_path, e
                ))
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            ShelfError::Ipc(format!("Failed to bind socket {:?}: {}", socket_path, e))
        })?;
        debug!("Listening for worker on {:?}", socket_path);

        Ok(Self {
            socket_path,
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the worker to connect
    pub async fn accept(&self) -> Result<FrameLink, ShelfError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| ShelfError::Ipc(format!("Failed to accept connection: {}", e)))?;
        debug!("Worker connected on {:?}", self.socket_path);
        Ok(FrameLink::over_stream(stream))
    }
}

impl Drop for ShelfIpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket {:?}: {}", self.socket_path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shelf::channel::protocol::ShelfMessage;
    use crate::shelf::ipc::client;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_accept_and_exchange() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("sockets").join("clock.sock");
        let listener = ShelfIpcListener::bind(&socket_path).unwrap();

        let connect = tokio::spawn({
            let socket_path = socket_path.clone();
            async move { client::connect(&socket_path).await }
        });
        let mut host = listener.accept().await.unwrap();
        let worker = connect.await.unwrap().unwrap();

        worker
            .send(&ShelfMessage::ServiceCreated {
                service_name: "clock".to_string(),
            })
            .unwrap();
        let received = host.recv().await.unwrap().unwrap();
        assert_eq!(received.service_name(), "clock");
    }

    #[tokio::test]
    async fn test_socket_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("clock.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let listener = ShelfIpcListener::bind(&socket_path).unwrap();
        assert!(socket_path.exists());
        drop(listener);
        assert!(!socket_path.exists());
    }
}
