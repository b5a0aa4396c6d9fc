//! In-process isolation
//!
//! The worker runs in its own tokio task inside the host process. It shares
//! nothing with the host but an in-memory frame link, and its panics are
//! caught and reported as faults by the worker runtime.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::shelf::channel::mailbox::Recipient;
use crate::shelf::channel::protocol::{Delivery, UnloadReason};
use crate::shelf::ipc::link::FrameLink;
use crate::shelf::isolation::{BoundaryCore, IsolationSettings};
use crate::shelf::registry::BootstrapperRegistry;
use crate::shelf::traits::{ServiceDescriptor, ShelfError};
use crate::shelf::worker::{host_shelf, WorkerIdentity};

/// Reference to a worker running in a host task
pub struct SandboxedShelf {
    pub(crate) core: BoundaryCore,
    registry: Arc<BootstrapperRegistry>,
    create_timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl SandboxedShelf {
    pub fn new(
        descriptor: Arc<ServiceDescriptor>,
        settings: &IsolationSettings,
        owner: Recipient<Delivery>,
        generation: u64,
    ) -> Self {
        Self {
            core: BoundaryCore::new(descriptor, owner, generation, settings.unload_timeout),
            registry: Arc::clone(&settings.registry),
            create_timeout: settings.create_timeout,
            worker: None,
        }
    }

    pub async fn create(&mut self) -> Result<(), ShelfError> {
        if self.core.is_created() {
            return Ok(());
        }

        if let Err(e) = self.try_create().await {
            self.core.report_creation_failure(&e);
            self.dispose();
            return Err(ShelfError::creation(
                self.core.service_name(),
                self.core.descriptor.bootstrapper.clone(),
                e,
            ));
        }
        Ok(())
    }

    async fn try_create(&mut self) -> Result<(), ShelfError> {
        let descriptor = Arc::clone(&self.core.descriptor);
        let bootstrapper = self.registry.resolve(descriptor.bootstrapper_key())?;

        let channel_name = format!("{}-{}", descriptor.name, Uuid::new_v4().simple());
        let identity = WorkerIdentity {
            address: format!("task://{}", channel_name),
            channel_name,
            bootstrapper: descriptor.bootstrapper.clone(),
        };
        let (mut host_link, worker_link) = FrameLink::pair();
        debug!("Starting sandboxed worker for {}", descriptor.name);
        self.worker = Some(tokio::spawn(host_shelf(
            self.core.context(),
            bootstrapper,
            identity,
            worker_link,
        )));

        let (address, channel_name) = timeout(self.create_timeout, host_link.await_listening())
            .await
            .map_err(|_| {
                ShelfError::Timeout(format!(
                    "sandboxed worker for service '{}' to start listening",
                    descriptor.name
                ))
            })??;

        info!(
            "Sandboxed worker for {} listening at {}",
            descriptor.name, address
        );
        self.core.bind_channel(address, channel_name);
        self.core.attach(host_link);
        Ok(())
    }

    pub async fn unload(&mut self) -> UnloadReason {
        let reason = self.core.unload().await;
        self.core.release().await;
        self.dispose();
        reason
    }

    pub fn dispose(&mut self) {
        self.core.dispose();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for SandboxedShelf {
    fn drop(&mut self) {
        self.dispose();
    }
}
