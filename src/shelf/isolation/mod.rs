//! Isolation references
//!
//! A reference is a controller's handle on one worker behind an isolation
//! boundary. Both variants share the same life: build the worker, wait for
//! it to announce its channel, pump its messages to the owning controller
//! tagged with the reference's generation, and tear it down exactly once.
//! Only encoded frames ever cross between host and worker.

pub mod sandboxed;

#[cfg(unix)]
pub mod external;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::shelf::channel::mailbox::Recipient;
use crate::shelf::channel::protocol::{
    Delivery, FaultReport, FaultStage, ShelfMessage, UnloadReason,
};
use crate::shelf::ipc::link::{FrameLink, FrameReceiver, FrameSender};
#[cfg(unix)]
use crate::shelf::process::spawner::ShelfProcessSpawner;
use crate::shelf::registry::BootstrapperRegistry;
use crate::shelf::traits::{IsolationLevel, ServiceDescriptor, ShelfContext, ShelfError};

#[cfg(unix)]
pub use external::ProcessShelf;
pub use sandboxed::SandboxedShelf;

/// Default time a worker gets to build its service and announce itself
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time a worker gets to acknowledge an unload request
pub const DEFAULT_UNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for flushing queued frames when a reference is released
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// What references need to build workers
#[derive(Debug, Clone)]
pub struct IsolationSettings {
    pub registry: Arc<BootstrapperRegistry>,
    #[cfg(unix)]
    pub spawner: Arc<ShelfProcessSpawner>,
    pub create_timeout: Duration,
    pub unload_timeout: Duration,
}

impl IsolationSettings {
    #[cfg(unix)]
    pub fn new(registry: Arc<BootstrapperRegistry>, spawner: Arc<ShelfProcessSpawner>) -> Self {
        Self {
            registry,
            spawner,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            unload_timeout: DEFAULT_UNLOAD_TIMEOUT,
        }
    }

    #[cfg(not(unix))]
    pub fn new(registry: Arc<BootstrapperRegistry>) -> Self {
        Self {
            registry,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            unload_timeout: DEFAULT_UNLOAD_TIMEOUT,
        }
    }

    /// Settings for in-process use: worker processes relaunch the running executable
    pub fn for_registry(registry: BootstrapperRegistry) -> Self {
        let registry = Arc::new(registry);
        #[cfg(unix)]
        {
            let executable = std::env::current_exe()
                .unwrap_or_else(|_| std::path::PathBuf::from("shelf-host"));
            let socket_dir = std::env::temp_dir().join("shelf-host").join("sockets");
            Self::new(
                registry,
                Arc::new(ShelfProcessSpawner::new(executable, socket_dir)),
            )
        }
        #[cfg(not(unix))]
        {
            Self::new(registry)
        }
    }

    pub fn with_create_timeout(mut self, create_timeout: Duration) -> Self {
        self.create_timeout = create_timeout;
        self
    }

    pub fn with_unload_timeout(mut self, unload_timeout: Duration) -> Self {
        self.unload_timeout = unload_timeout;
        self
    }
}

/// Snapshot of a reference, for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceInfo {
    pub isolation: IsolationLevel,
    pub generation: u64,
    pub address: Option<String>,
    pub channel_name: Option<String>,
    pub modules: Vec<String>,
    pub live: bool,
}

/// Handle on one worker behind its isolation boundary
pub enum IsolationReference {
    Sandboxed(SandboxedShelf),
    #[cfg(unix)]
    ExternalProcess(ProcessShelf),
}

impl IsolationReference {
    /// Build an unstarted reference for `descriptor`
    ///
    /// Worker messages are forwarded to `owner` tagged with `generation`.
    pub fn new(
        descriptor: Arc<ServiceDescriptor>,
        settings: &IsolationSettings,
        owner: Recipient<Delivery>,
        generation: u64,
    ) -> Self {
        match descriptor.isolation {
            IsolationLevel::Sandboxed => IsolationReference::Sandboxed(SandboxedShelf::new(
                descriptor, settings, owner, generation,
            )),
            #[cfg(unix)]
            IsolationLevel::ExternalProcess => IsolationReference::ExternalProcess(
                ProcessShelf::new(descriptor, settings, owner, generation),
            ),
            #[cfg(not(unix))]
            IsolationLevel::ExternalProcess => {
                warn!(
                    "External-process isolation is unavailable here, sandboxing {}",
                    descriptor.name
                );
                IsolationReference::Sandboxed(SandboxedShelf::new(
                    descriptor, settings, owner, generation,
                ))
            }
        }
    }

    fn core(&self) -> &BoundaryCore {
        match self {
            IsolationReference::Sandboxed(shelf) => &shelf.core,
            #[cfg(unix)]
            IsolationReference::ExternalProcess(shelf) => &shelf.core,
        }
    }

    fn core_mut(&mut self) -> &mut BoundaryCore {
        match self {
            IsolationReference::Sandboxed(shelf) => &mut shelf.core,
            #[cfg(unix)]
            IsolationReference::ExternalProcess(shelf) => &mut shelf.core,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        match self {
            IsolationReference::Sandboxed(_) => IsolationLevel::Sandboxed,
            #[cfg(unix)]
            IsolationReference::ExternalProcess(_) => IsolationLevel::ExternalProcess,
        }
    }

    pub fn generation(&self) -> u64 {
        self.core().generation
    }

    /// Queue a module for preloading; ignored once the worker exists
    pub fn load_module(&mut self, module: impl Into<String>) {
        self.core_mut().load_module(module.into());
    }

    /// Build the worker and wait for it to announce its channel
    ///
    /// On failure the owner has already received a creation fault and the
    /// reference holds nothing.
    pub async fn create(&mut self) -> Result<(), ShelfError> {
        match self {
            IsolationReference::Sandboxed(shelf) => shelf.create().await,
            #[cfg(unix)]
            IsolationReference::ExternalProcess(shelf) => shelf.create().await,
        }
    }

    /// Record the address and channel the worker announced
    pub fn bind_channel(&mut self, address: impl Into<String>, channel_name: impl Into<String>) {
        self.core_mut()
            .bind_channel(address.into(), channel_name.into());
    }

    /// Deliver a command to the worker
    pub fn send(&self, message: &ShelfMessage) -> Result<(), ShelfError> {
        self.core().send(message)
    }

    /// Ask the worker to unload, then release it
    pub async fn unload(&mut self) -> UnloadReason {
        match self {
            IsolationReference::Sandboxed(shelf) => shelf.unload().await,
            #[cfg(unix)]
            IsolationReference::ExternalProcess(shelf) => shelf.unload().await,
        }
    }

    /// Tear the worker down without asking; idempotent
    pub fn dispose(&mut self) {
        match self {
            IsolationReference::Sandboxed(shelf) => shelf.dispose(),
            #[cfg(unix)]
            IsolationReference::ExternalProcess(shelf) => shelf.dispose(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.core().is_live()
    }

    pub fn info(&self) -> ReferenceInfo {
        self.core().info(self.isolation())
    }
}

/// Shared teardown signal between a reference and its background tasks
///
/// `closing` marks a teardown the host asked for; `reported` ensures at most
/// one fault is reported for the reference's lifetime.
#[derive(Debug, Default)]
pub(crate) struct Teardown {
    closing: AtomicBool,
    reported: AtomicBool,
}

impl Teardown {
    pub(crate) fn begin_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Claim the single fault report; fails once closing or already claimed
    pub(crate) fn claim_report(&self) -> bool {
        !self.is_closing() && !self.reported.swap(true, Ordering::SeqCst)
    }
}

/// State and behavior common to both isolation variants
pub(crate) struct BoundaryCore {
    pub(crate) descriptor: Arc<ServiceDescriptor>,
    owner: Recipient<Delivery>,
    pub(crate) generation: u64,
    unload_timeout: Duration,
    pub(crate) modules: Vec<String>,
    address: Option<String>,
    channel_name: Option<String>,
    sender: Option<FrameSender>,
    pump: Option<JoinHandle<()>>,
    ack: Option<watch::Receiver<bool>>,
    pub(crate) teardown: Arc<Teardown>,
    created: bool,
}

impl BoundaryCore {
    pub(crate) fn new(
        descriptor: Arc<ServiceDescriptor>,
        owner: Recipient<Delivery>,
        generation: u64,
        unload_timeout: Duration,
    ) -> Self {
        Self {
            descriptor,
            owner,
            generation,
            unload_timeout,
            modules: Vec::new(),
            address: None,
            channel_name: None,
            sender: None,
            pump: None,
            ack: None,
            teardown: Arc::new(Teardown::default()),
            created: false,
        }
    }

    pub(crate) fn service_name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn is_created(&self) -> bool {
        self.created
    }

    fn load_module(&mut self, module: String) {
        if self.created {
            debug!(
                "Ignoring module {} for {}: worker already created",
                module,
                self.service_name()
            );
            return;
        }
        if !self.modules.contains(&module) {
            self.modules.push(module);
        }
    }

    pub(crate) fn context(&self) -> ShelfContext {
        ShelfContext {
            service_name: self.descriptor.name.clone(),
            working_dir: self.descriptor.working_dir.clone(),
            modules: self.modules.clone(),
        }
    }

    pub(crate) fn bind_channel(&mut self, address: String, channel_name: String) {
        debug!(
            "Service {} bound to {} ({})",
            self.service_name(),
            address,
            channel_name
        );
        self.address = Some(address);
        self.channel_name = Some(channel_name);
    }

    /// Take ownership of an announced link and start pumping its messages
    pub(crate) fn attach(&mut self, link: FrameLink) {
        let (sender, receiver) = link.into_parts();
        let (ack_tx, ack_rx) = watch::channel(false);
        self.pump = Some(tokio::spawn(pump(
            self.descriptor.name.clone(),
            self.generation,
            receiver,
            self.owner.clone(),
            Arc::clone(&self.teardown),
            ack_tx,
        )));
        self.sender = Some(sender);
        self.ack = Some(ack_rx);
        self.created = true;
        self.announce_listening();
    }

    /// Pass the worker's announcement on to the owner
    fn announce_listening(&self) {
        let (Some(address), Some(channel_name)) = (&self.address, &self.channel_name) else {
            return;
        };
        let message = ShelfMessage::WorkerListening {
            service_name: self.descriptor.name.clone(),
            address: address.clone(),
            channel_name: channel_name.clone(),
        };
        let delivery = Delivery {
            generation: self.generation,
            message,
        };
        if self.owner.send(delivery).is_err() {
            debug!("Owner of {} is gone, announcement dropped", self.service_name());
        }
    }

    /// Tell the owner why creation failed
    pub(crate) fn report_creation_failure(&self, error: &ShelfError) {
        let mut report = match error {
            ShelfError::Remote(report) => report.clone(),
            other => FaultReport::from_error(FaultStage::Creation, other),
        };
        report.stage = FaultStage::Creation;
        if report.bootstrapper.is_none() {
            report.bootstrapper = self.descriptor.bootstrapper.clone();
        }
        if self.teardown.claim_report() {
            send_fault(&self.owner, self.generation, self.service_name(), report);
        }
    }

    /// Callback reporting an unrequested worker exit
    pub(crate) fn exit_reporter(&self) -> impl FnOnce(String) + Send + 'static {
        let owner = self.owner.clone();
        let teardown = Arc::clone(&self.teardown);
        let generation = self.generation;
        let service_name = self.descriptor.name.clone();
        move |status: String| {
            if teardown.claim_report() {
                warn!("Worker for {} exited unexpectedly: {}", service_name, status);
                send_fault(
                    &owner,
                    generation,
                    &service_name,
                    FaultReport::new(FaultStage::Exited, status),
                );
            }
        }
    }

    pub(crate) fn send(&self, message: &ShelfMessage) -> Result<(), ShelfError> {
        let unavailable = || ShelfError::ReferenceUnavailable(self.descriptor.name.clone());
        if !self.is_live() {
            return Err(unavailable());
        }
        let sender = self.sender.as_ref().ok_or_else(unavailable)?;
        sender.send(message).map_err(|e| match e {
            ShelfError::Serialization(_) => e,
            _ => unavailable(),
        })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.created
            && !self.teardown.is_closing()
            && self.sender.as_ref().is_some_and(|s| !s.is_closed())
            && self.pump.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Request an unload and wait for the acknowledgment
    pub(crate) async fn unload(&mut self) -> UnloadReason {
        if !self.is_live() {
            return UnloadReason::Unexpected;
        }
        let request = ShelfMessage::UnloadService {
            service_name: self.descriptor.name.clone(),
        };
        self.teardown.begin_closing();

        let sent = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(&request).is_ok());
        let Some(ack) = self.ack.as_mut() else {
            return UnloadReason::Unexpected;
        };
        if !sent {
            return UnloadReason::Unexpected;
        }

        let acknowledged = timeout(self.unload_timeout, ack.wait_for(|acked| *acked))
            .await
            .map(|result| result.is_ok());
        match acknowledged {
            Ok(true) => {
                info!("Worker for {} unloaded", self.service_name());
                UnloadReason::Requested
            }
            Ok(false) => {
                warn!(
                    "Worker for {} went away before acknowledging unload",
                    self.service_name()
                );
                UnloadReason::Unexpected
            }
            Err(_) => {
                warn!(
                    "Worker for {} did not acknowledge unload within {:?}",
                    self.service_name(),
                    self.unload_timeout
                );
                UnloadReason::TimedOut
            }
        }
    }

    /// Flush queued frames, then tear down
    pub(crate) async fn release(&mut self) {
        self.teardown.begin_closing();
        if let Some(sender) = self.sender.take() {
            if timeout(FLUSH_TIMEOUT, sender.close()).await.is_err() {
                debug!("Flushing link for {} timed out", self.service_name());
            }
        }
        self.dispose();
    }

    pub(crate) fn dispose(&mut self) {
        self.teardown.begin_closing();
        self.sender = None;
        self.ack = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn info(&self, isolation: IsolationLevel) -> ReferenceInfo {
        ReferenceInfo {
            isolation,
            generation: self.generation,
            address: self.address.clone(),
            channel_name: self.channel_name.clone(),
            modules: self.modules.clone(),
            live: self.is_live(),
        }
    }
}

fn send_fault(owner: &Recipient<Delivery>, generation: u64, service_name: &str, fault: FaultReport) {
    let delivery = Delivery {
        generation,
        message: ShelfMessage::ServiceFault {
            service_name: service_name.to_string(),
            fault,
        },
    };
    if let Err(e) = owner.send(delivery) {
        debug!("Owner of {} is gone, dropping fault: {}", service_name, e);
    }
}

/// Forward worker messages to the owner until the link closes
async fn pump(
    service_name: String,
    generation: u64,
    mut receiver: FrameReceiver,
    owner: Recipient<Delivery>,
    teardown: Arc<Teardown>,
    ack: watch::Sender<bool>,
) {
    while let Some(frame) = receiver.recv().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable frame from {}: {}", service_name, e);
                continue;
            }
        };

        if let ShelfMessage::WorkerUnloaded { .. } = message {
            // the worker is leaving on its own terms
            teardown.begin_closing();
            ack.send_replace(true);
        }
        if owner.send(Delivery { generation, message }).is_err() {
            debug!("Owner of {} is gone, stopping pump", service_name);
            return;
        }
    }

    if teardown.claim_report() {
        warn!("Channel to {} closed unexpectedly", service_name);
        send_fault(
            &owner,
            generation,
            &service_name,
            FaultReport::new(FaultStage::Exited, "worker channel closed unexpectedly"),
        );
    }
}
