//! Service controller
//!
//! One controller per hosted service. It owns the service's isolation
//! reference, turns lifecycle requests into commands for the worker, tracks
//! the service state, and relays worker events to the coordinator. All of
//! that happens on the controller's own mailbox, one message at a time.

use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};

use crate::shelf::channel::mailbox::{Address, Inbox, Mailbox, Recipient, Routed};
use crate::shelf::channel::protocol::{
    Delivery, LifecycleCommand, MessageKind, ShelfMessage, UnloadReason,
};
use crate::shelf::isolation::{IsolationReference, IsolationSettings, ReferenceInfo};
use crate::shelf::traits::{ServiceDescriptor, ServiceState, ShelfError};

/// Capacity of the per-controller state transition feed
const TRANSITION_CAPACITY: usize = 64;

/// Messages handled by a controller's mailbox
#[derive(Debug)]
pub enum ControllerMessage {
    Create {
        reply: oneshot::Sender<Result<(), ShelfError>>,
    },
    Command(LifecycleCommand),
    Unload {
        reply: oneshot::Sender<UnloadReason>,
    },
    Inspect {
        reply: oneshot::Sender<Option<ReferenceInfo>>,
    },
    /// Message forwarded by the isolation reference
    Worker(Delivery),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerRoute {
    Create,
    Command,
    Unload,
    Inspect,
    Worker(MessageKind),
}

impl Routed for ControllerMessage {
    type Route = ControllerRoute;

    fn route(&self) -> ControllerRoute {
        match self {
            ControllerMessage::Create { .. } => ControllerRoute::Create,
            ControllerMessage::Command(_) => ControllerRoute::Command,
            ControllerMessage::Unload { .. } => ControllerRoute::Unload,
            ControllerMessage::Inspect { .. } => ControllerRoute::Inspect,
            ControllerMessage::Worker(delivery) => ControllerRoute::Worker(delivery.message.kind()),
        }
    }
}

/// Worker events a controller reacts to
const WORKER_EVENTS: [MessageKind; 6] = [
    MessageKind::WorkerListening,
    MessageKind::ServiceRunning,
    MessageKind::ServiceStopped,
    MessageKind::ServicePaused,
    MessageKind::WorkerUnloaded,
    MessageKind::ServiceFault,
];

/// What a controller factory is handed by the coordinator
#[derive(Clone)]
pub struct ControllerContext {
    /// Coordinator inbox that receives this controller's events
    pub coordinator: Address<ShelfMessage>,
    pub settings: IsolationSettings,
}

/// Deferred controller construction, invoked once by the coordinator
pub type ControllerFactory =
    Box<dyn FnOnce(ControllerContext) -> Result<ServiceController, ShelfError> + Send>;

/// State owned by the controller's mailbox task
struct ControllerCore {
    descriptor: Arc<ServiceDescriptor>,
    settings: IsolationSettings,
    coordinator: Address<ShelfMessage>,
    deliveries: Recipient<Delivery>,
    reference: Option<IsolationReference>,
    generation: u64,
    state: watch::Sender<ServiceState>,
    transitions: broadcast::Sender<ServiceState>,
}

impl ControllerCore {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn set_state(&self, next: ServiceState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!("Service {} is {}", self.descriptor.name, next);
            let _ = self.transitions.send(next);
        }
    }

    fn publish(&self, message: ShelfMessage) {
        if let Err(e) = self.coordinator.send(message) {
            debug!("Coordinator gone, dropping event from {}: {}", self.name(), e);
        }
    }

    fn publish_unloaded(&self, reason: UnloadReason) {
        self.publish(ShelfMessage::ServiceUnloaded {
            service_name: self.descriptor.name.clone(),
            reason,
        });
    }

    async fn create(&mut self) -> Result<(), ShelfError> {
        if self.reference.as_ref().is_some_and(|r| r.is_live()) {
            debug!("Service {} already has a live worker", self.name());
            return Ok(());
        }
        if let Some(mut stale) = self.reference.take() {
            stale.dispose();
        }

        self.set_state(ServiceState::Creating);
        self.generation += 1;
        let mut reference = IsolationReference::new(
            Arc::clone(&self.descriptor),
            &self.settings,
            self.deliveries.clone(),
            self.generation,
        );
        for module in &self.descriptor.modules {
            reference.load_module(module.clone());
        }

        match reference.create().await {
            Ok(()) => {
                info!(
                    "Created {} worker for service {}",
                    reference.isolation(),
                    self.name()
                );
                self.reference = Some(reference);
                self.set_state(ServiceState::Created);
                self.publish(ShelfMessage::ServiceCreated {
                    service_name: self.descriptor.name.clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to create service {}: {}", self.name(), e);
                self.set_state(ServiceState::Unloaded);
                Err(e)
            }
        }
    }

    fn command(&mut self, command: LifecycleCommand) {
        let Some(reference) = self.reference.as_ref() else {
            warn!(
                "Cannot {} service {}: no worker is loaded",
                command,
                self.name()
            );
            self.publish_unloaded(UnloadReason::AlreadyUnloaded);
            return;
        };

        match reference.send(&command.to_message(self.name())) {
            Ok(()) => self.set_state(command.transitional_state()),
            Err(e) => {
                warn!("Failed to {} service {}: {}", command, self.name(), e);
                if let Some(mut reference) = self.reference.take() {
                    reference.dispose();
                }
                self.set_state(ServiceState::Unloaded);
                self.publish_unloaded(UnloadReason::ReferenceUnavailable);
            }
        }
    }

    async fn unload(&mut self) -> UnloadReason {
        self.set_state(ServiceState::Unloading);
        self.publish(ShelfMessage::ServiceUnloading {
            service_name: self.descriptor.name.clone(),
        });

        let reason = match self.reference.take() {
            Some(mut reference) => reference.unload().await,
            None => UnloadReason::AlreadyUnloaded,
        };

        info!("Service {} unloaded ({:?})", self.name(), reason);
        self.set_state(ServiceState::Unloaded);
        self.publish_unloaded(reason);
        reason
    }

    fn on_worker(&mut self, delivery: Delivery) {
        if delivery.generation != self.generation {
            // faults are relayed whatever their generation; status from a replaced worker is not
            if let ShelfMessage::ServiceFault { .. } = delivery.message {
                debug!(
                    "Relaying fault from generation {} of {}",
                    delivery.generation,
                    self.name()
                );
                self.publish(delivery.message);
            } else {
                trace!(
                    "Ignoring {:?} from a replaced worker of {}",
                    delivery.message.kind(),
                    self.name()
                );
            }
            return;
        }

        match delivery.message {
            ShelfMessage::ServiceFault {
                service_name,
                fault,
            } => {
                warn!("Service {} faulted: {}", service_name, fault);
                if self.reference.is_some() {
                    self.set_state(ServiceState::Faulted);
                }
                self.publish(ShelfMessage::ServiceFault {
                    service_name,
                    fault,
                });
            }
            listening @ ShelfMessage::WorkerListening { .. } => {
                if self.reference.is_some() {
                    self.publish(listening);
                }
            }
            ShelfMessage::WorkerUnloaded { .. } => {
                if let Some(mut reference) = self.reference.take() {
                    warn!("Worker for {} unloaded on its own", self.name());
                    reference.dispose();
                    self.set_state(ServiceState::Unloaded);
                    self.publish_unloaded(UnloadReason::Unexpected);
                }
            }
            status => {
                if self.reference.is_none() {
                    return;
                }
                let next = match status.kind() {
                    MessageKind::ServiceRunning => ServiceState::Running,
                    MessageKind::ServiceStopped => ServiceState::Stopped,
                    MessageKind::ServicePaused => ServiceState::Paused,
                    _ => return,
                };
                self.set_state(next);
                self.publish(status);
            }
        }
    }
}

/// Handle on one hosted service
pub struct ServiceController {
    descriptor: Arc<ServiceDescriptor>,
    address: Address<ControllerMessage>,
    state: watch::Receiver<ServiceState>,
    transitions: broadcast::Sender<ServiceState>,
    mailbox: Mutex<Option<Mailbox<ControllerCore>>>,
}

impl ServiceController {
    /// Factory producing a controller for `descriptor` on demand
    pub fn factory(descriptor: ServiceDescriptor) -> ControllerFactory {
        let descriptor = Arc::new(descriptor);
        Box::new(move |context| ServiceController::new(descriptor, context))
    }

    /// Create a controller and start its mailbox
    pub fn new(
        descriptor: Arc<ServiceDescriptor>,
        context: ControllerContext,
    ) -> Result<Self, ShelfError> {
        let (address, mut inbox) =
            Inbox::<ControllerCore, ControllerMessage>::new(format!("controller:{}", descriptor.name));
        let (state_tx, state_rx) = watch::channel(ServiceState::Unloaded);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);

        inbox
            .subscribe(ControllerRoute::Create, |core, message| {
                async move {
                    if let ControllerMessage::Create { reply } = message {
                        let _ = reply.send(core.create().await);
                    }
                }
                .boxed()
            })?
            .subscribe(ControllerRoute::Command, |core, message| {
                async move {
                    if let ControllerMessage::Command(command) = message {
                        core.command(command);
                    }
                }
                .boxed()
            })?
            .subscribe(ControllerRoute::Unload, |core, message| {
                async move {
                    if let ControllerMessage::Unload { reply } = message {
                        let _ = reply.send(core.unload().await);
                    }
                }
                .boxed()
            })?
            .subscribe(ControllerRoute::Inspect, |core, message| {
                async move {
                    if let ControllerMessage::Inspect { reply } = message {
                        let _ = reply.send(core.reference.as_ref().map(|r| r.info()));
                    }
                }
                .boxed()
            })?;
        for kind in WORKER_EVENTS {
            inbox.subscribe(ControllerRoute::Worker(kind), |core, message| {
                async move {
                    if let ControllerMessage::Worker(delivery) = message {
                        core.on_worker(delivery);
                    }
                }
                .boxed()
            })?;
        }

        let core = ControllerCore {
            descriptor: Arc::clone(&descriptor),
            settings: context.settings,
            coordinator: context.coordinator,
            deliveries: address.recipient(ControllerMessage::Worker),
            reference: None,
            generation: 0,
            state: state_tx,
            transitions: transitions.clone(),
        };

        Ok(Self {
            descriptor,
            address,
            state: state_rx,
            transitions,
            mailbox: Mutex::new(Some(inbox.spawn(core))),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Feed of every state change from now on
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ServiceState> {
        self.transitions.subscribe()
    }

    /// Wait until the controller reaches `target`
    pub async fn wait_for_state(
        &self,
        target: ServiceState,
        wait: Duration,
    ) -> Result<(), ShelfError> {
        let mut state = self.state.clone();
        let reached = timeout(wait, state.wait_for(|s| *s == target))
            .await
            .map(|result| result.is_ok());
        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(ShelfError::EndpointClosed(self.address.endpoint().to_string())),
            Err(_) => Err(ShelfError::Timeout(format!(
                "service '{}' to become {}",
                self.name(),
                target
            ))),
        }
    }

    /// Create the worker and wait until it is listening
    pub async fn create(&self) -> Result<(), ShelfError> {
        let (reply, response) = oneshot::channel();
        self.address.send(ControllerMessage::Create { reply })?;
        response
            .await
            .map_err(|_| ShelfError::EndpointClosed(self.address.endpoint().to_string()))?
    }

    /// Send a lifecycle command without waiting for the acknowledgment
    pub fn send_command(&self, command: LifecycleCommand) -> Result<(), ShelfError> {
        self.address.send(ControllerMessage::Command(command))
    }

    pub fn start(&self) -> Result<(), ShelfError> {
        self.send_command(LifecycleCommand::Start)
    }

    pub fn stop(&self) -> Result<(), ShelfError> {
        self.send_command(LifecycleCommand::Stop)
    }

    pub fn pause(&self) -> Result<(), ShelfError> {
        self.send_command(LifecycleCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), ShelfError> {
        self.send_command(LifecycleCommand::Continue)
    }

    /// Unload the worker; safe to call repeatedly
    pub async fn unload(&self) -> Result<UnloadReason, ShelfError> {
        let (reply, response) = oneshot::channel();
        self.address.send(ControllerMessage::Unload { reply })?;
        response
            .await
            .map_err(|_| ShelfError::EndpointClosed(self.address.endpoint().to_string()))
    }

    /// Snapshot of the current isolation reference, if any
    pub async fn reference_info(&self) -> Result<Option<ReferenceInfo>, ShelfError> {
        let (reply, response) = oneshot::channel();
        self.address.send(ControllerMessage::Inspect { reply })?;
        response
            .await
            .map_err(|_| ShelfError::EndpointClosed(self.address.endpoint().to_string()))
    }

    /// Stop the mailbox and release the worker without asking it to unload
    pub async fn dispose(&self) {
        let Some(mailbox) = self.mailbox.lock().await.take() else {
            return;
        };
        if let Some(mut core) = mailbox.shutdown().await {
            if let Some(mut reference) = core.reference.take() {
                reference.dispose();
            }
            core.set_state(ServiceState::Unloaded);
        }
        debug!("Controller for {} disposed", self.name());
    }
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("name", &self.descriptor.name)
            .field("state", &self.state())
            .finish()
    }
}
