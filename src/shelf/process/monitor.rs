//! Worker process monitoring
//!
//! Watches a worker's child process for the lifetime of its reference. An
//! exit nobody asked for is handed to the reference's exit callback; on
//! release the child gets a grace period to leave on its own before it is
//! killed.

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shelf::process::spawner::describe_exit;

/// Default time a released worker gets to exit on its own
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(3);

/// Worker process monitor
pub struct ShelfProcessMonitor {
    grace: Duration,
}

impl Default for ShelfProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShelfProcessMonitor {
    /// Create a new monitor with the default grace period
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start watching `child`
    ///
    /// `on_exit` is called with the exit description if the child exits before
    /// `cancel` fires. Cancelling reaps the child.
    pub fn watch<F>(
        &self,
        service_name: String,
        mut child: Child,
        cancel: CancellationToken,
        on_exit: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let grace = self.grace;
        tokio::spawn(async move {
            debug!(
                "Monitoring worker process for {} (pid {:?})",
                service_name,
                child.id()
            );
            tokio::select! {
                status = child.wait() => {
                    let status = describe_exit(status);
                    info!("Worker process for {} exited: {}", service_name, status);
                    on_exit(status);
                }
                _ = cancel.cancelled() => {
                    match timeout(grace, child.wait()).await {
                        Ok(status) => {
                            debug!(
                                "Worker process for {} exited after release: {}",
                                service_name,
                                describe_exit(status)
                            );
                        }
                        Err(_) => {
                            warn!(
                                "Worker process for {} did not exit within {:?}, killing",
                                service_name, grace
                            );
                            if let Err(e) = child.kill().await {
                                warn!("Failed to kill worker for {}: {}", service_name, e);
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_unexpected_exit_reported() {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let (tx, rx) = oneshot::channel();

        let monitor = ShelfProcessMonitor::new();
        let handle = monitor.watch("clock".to_string(), child, CancellationToken::new(), |status| {
            let _ = tx.send(status);
        });

        let status = rx.await.unwrap();
        assert!(status.contains('3'));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_kills_lingering_child() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel::<String>();

        let monitor = ShelfProcessMonitor::new().with_grace(Duration::from_millis(50));
        let handle = monitor.watch("clock".to_string(), child, cancel.clone(), move |status| {
            let _ = tx.send(status);
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
