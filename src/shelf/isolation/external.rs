//! Out-of-process isolation
//!
//! The worker is a separate OS process running the host executable in
//! `shelf` mode. It connects back over a Unix socket and is watched by a
//! process monitor for as long as the reference holds it.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::shelf::channel::mailbox::Recipient;
use crate::shelf::channel::protocol::{Delivery, UnloadReason};
use crate::shelf::isolation::{BoundaryCore, IsolationSettings};
use crate::shelf::process::monitor::ShelfProcessMonitor;
use crate::shelf::process::spawner::ShelfProcessSpawner;
use crate::shelf::traits::{ServiceDescriptor, ShelfError};

/// Reference to a worker running in a child process
pub struct ProcessShelf {
    pub(crate) core: BoundaryCore,
    spawner: Arc<ShelfProcessSpawner>,
    create_timeout: Duration,
    monitor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl ProcessShelf {
    pub fn new(
        descriptor: Arc<ServiceDescriptor>,
        settings: &IsolationSettings,
        owner: Recipient<Delivery>,
        generation: u64,
    ) -> Self {
        Self {
            core: BoundaryCore::new(descriptor, owner, generation, settings.unload_timeout),
            spawner: Arc::clone(&settings.spawner),
            create_timeout: settings.create_timeout,
            monitor: None,
            cancel: CancellationToken::new(),
            pid: None,
        }
    }

    /// Process id of the worker, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn create(&mut self) -> Result<(), ShelfError> {
        if self.core.is_created() {
            return Ok(());
        }

        let descriptor = Arc::clone(&self.core.descriptor);
        let spawned = match self
            .spawner
            .spawn(&descriptor, &self.core.modules, self.create_timeout)
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                self.core.report_creation_failure(&e);
                self.dispose();
                return Err(ShelfError::creation(
                    &descriptor.name,
                    descriptor.bootstrapper.clone(),
                    e,
                ));
            }
        };

        self.pid = spawned.child.id();
        self.core
            .bind_channel(spawned.address, spawned.channel_name);
        self.core.attach(spawned.link);
        self.monitor = Some(ShelfProcessMonitor::new().watch(
            descriptor.name.clone(),
            spawned.child,
            self.cancel.clone(),
            self.core.exit_reporter(),
        ));
        Ok(())
    }

    pub async fn unload(&mut self) -> UnloadReason {
        let reason = self.core.unload().await;
        self.core.release().await;
        self.dispose();
        if let Some(monitor) = self.monitor.take() {
            // the child is given its grace period before being killed
            let _ = monitor.await;
        }
        reason
    }

    pub fn dispose(&mut self) {
        self.core.dispose();
        self.cancel.cancel();
    }
}

impl Drop for ProcessShelf {
    fn drop(&mut self) {
        self.dispose();
    }
}
