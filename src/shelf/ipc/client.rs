//! IPC client used by worker processes to reach their host

use std::path::Path;
use tokio::net::UnixStream;
use tracing::debug;

use crate::shelf::ipc::link::FrameLink;
use crate::shelf::traits::ShelfError;

/// Connect to the socket the host bound for this worker
pub async fn connect<P: AsRef<Path>>(socket_path: P) -> Result<FrameLink, ShelfError> {
    let stream = UnixStream::connect(socket_path.as_ref())
        .await
        .map_err(|e| ShelfError::Ipc(format!("Failed to connect to socket: {}", e)))?;
    debug!("Connected to host IPC socket {:?}", socket_path.as_ref());
    Ok(FrameLink::over_stream(stream))
}
