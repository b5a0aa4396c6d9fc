//! Service coordinator
//!
//! Owns every hosted service's controller, drives their collective lifecycle
//! and aggregates the faults they report. Controllers are registered as
//! factories and only materialized when the collection is first needed.
//!
//! A lifecycle transition broadcasts one command to every controller not yet
//! in the target state and then waits, with a timeout, until each of them has
//! answered. How the wait ended decides the outcome; see [`judge_transition`].

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::shelf::channel::mailbox::{Address, Inbox, Mailbox};
use crate::shelf::channel::protocol::{LifecycleCommand, MessageKind, ShelfMessage, UnloadReason};
use crate::shelf::controller::{ControllerContext, ControllerFactory, ServiceController};
use crate::shelf::faults::{FaultHandler, FaultQueue};
use crate::shelf::isolation::IsolationSettings;
use crate::shelf::traits::{Fault, ServiceState, ShelfError};
use crate::utils::lock::{take_locked, with_lock, with_read_lock};

/// Default time a lifecycle transition may take
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the coordinator's event feed
const EVENT_CAPACITY: usize = 1024;

/// Events the coordinator relays to observers
const LIFECYCLE_EVENTS: [MessageKind; 7] = [
    MessageKind::WorkerListening,
    MessageKind::ServiceCreated,
    MessageKind::ServiceRunning,
    MessageKind::ServiceStopped,
    MessageKind::ServicePaused,
    MessageKind::ServiceUnloading,
    MessageKind::ServiceUnloaded,
];

/// Hook run around coordinator lifecycle operations
pub type CoordinatorHook = Box<dyn Fn(&ServiceCoordinator) + Send + Sync>;

/// Optional hooks run around start and stop
#[derive(Default)]
pub struct CoordinatorHooks {
    before_starting: Option<CoordinatorHook>,
    after_starting: Option<CoordinatorHook>,
    after_stopping: Option<CoordinatorHook>,
}

impl CoordinatorHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_starting<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServiceCoordinator) + Send + Sync + 'static,
    {
        self.before_starting = Some(Box::new(hook));
        self
    }

    pub fn after_starting<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServiceCoordinator) + Send + Sync + 'static,
    {
        self.after_starting = Some(Box::new(hook));
        self
    }

    pub fn after_stopping<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServiceCoordinator) + Send + Sync + 'static,
    {
        self.after_stopping = Some(Box::new(hook));
        self
    }
}

/// Name and state of one hosted service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub state: ServiceState,
}

/// Successful end of a lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Every service is in the target state
    Converged,
    /// More than one service is hosted, some reached the target and these did not
    Degraded { lagging: Vec<String> },
}

/// How a collective wait is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionVerdict {
    Converged,
    Degraded,
    TimedOut,
    AllFailed,
}

/// Judge a collective wait
///
/// A timed-out wait fails when only one service is hosted or none reached the
/// target state. Otherwise the wait fails only when no service reached the
/// target; partial convergence across several services counts as success.
pub fn judge_transition(hosted: usize, reached: usize, timed_out: bool) -> TransitionVerdict {
    if timed_out && (hosted == 1 || reached == 0) {
        TransitionVerdict::TimedOut
    } else if reached == 0 {
        TransitionVerdict::AllFailed
    } else if reached >= hosted {
        TransitionVerdict::Converged
    } else {
        TransitionVerdict::Degraded
    }
}

/// State owned by the coordinator's mailbox task
struct CoordinatorInbox {
    faults: Arc<FaultQueue>,
    events: broadcast::Sender<ShelfMessage>,
}

impl CoordinatorInbox {
    fn announce(&self, message: ShelfMessage) {
        // nobody listening is fine
        let _ = self.events.send(message);
    }

    async fn handle_fault(&self, message: ShelfMessage) {
        let ShelfMessage::ServiceFault {
            service_name,
            fault,
        } = message
        else {
            return;
        };
        let reported = Fault::from_report(&service_name, fault.clone());
        error!("{}", reported);
        self.faults.report(reported).await;
        self.announce(ShelfMessage::ServiceFault {
            service_name,
            fault,
        });
    }
}

/// Supervisor of every hosted service
pub struct ServiceCoordinator {
    transition_timeout: Duration,
    settings: IsolationSettings,
    address: Address<ShelfMessage>,
    mailbox: Mutex<Option<Mailbox<CoordinatorInbox>>>,
    controllers: RwLock<Vec<Arc<ServiceController>>>,
    pending: Mutex<Vec<ControllerFactory>>,
    faults: Arc<FaultQueue>,
    events: broadcast::Sender<ShelfMessage>,
    hooks: CoordinatorHooks,
}

impl ServiceCoordinator {
    /// Create a coordinator and start its mailbox
    pub fn new(
        transition_timeout: Duration,
        settings: IsolationSettings,
    ) -> Result<Self, ShelfError> {
        let (address, mut inbox) = Inbox::<CoordinatorInbox, ShelfMessage>::new("coordinator");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let faults = Arc::new(FaultQueue::new());

        for kind in LIFECYCLE_EVENTS {
            inbox.subscribe(kind, |state, message| {
                async move { state.announce(message) }.boxed()
            })?;
        }
        inbox.subscribe(MessageKind::ServiceFault, |state, message| {
            async move { state.handle_fault(message).await }.boxed()
        })?;

        let mailbox = inbox.spawn(CoordinatorInbox {
            faults: Arc::clone(&faults),
            events: events.clone(),
        });

        Ok(Self {
            transition_timeout,
            settings,
            address,
            mailbox: Mutex::new(Some(mailbox)),
            controllers: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            faults,
            events,
            hooks: CoordinatorHooks::default(),
        })
    }

    pub fn with_hooks(mut self, hooks: CoordinatorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Inbox that controllers publish their events to
    pub fn address(&self) -> Address<ShelfMessage> {
        self.address.clone()
    }

    pub fn transition_timeout(&self) -> Duration {
        self.transition_timeout
    }

    /// Queue controller factories for lazy materialization
    pub async fn register_controllers(&self, factories: Vec<ControllerFactory>) {
        let count = factories.len();
        with_lock(&self.pending, |pending| pending.extend(factories)).await;
        debug!("Registered {} controller factories", count);
    }

    /// Invoke every pending factory once
    ///
    /// Controllers keep their registration order. Calling again without new
    /// registrations does nothing.
    pub async fn materialize(&self) -> Result<(), ShelfError> {
        let factories = take_locked(&self.pending).await;
        if factories.is_empty() {
            return Ok(());
        }

        let context = ControllerContext {
            coordinator: self.address.clone(),
            settings: self.settings.clone(),
        };
        let mut controllers = self.controllers.write().await;
        let mut first_error = None;
        for factory in factories {
            match factory(context.clone()) {
                Ok(controller) => {
                    info!("Hosting service {}", controller.name());
                    controllers.push(Arc::new(controller));
                }
                Err(e) => {
                    error!("Failed to build service controller: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Materialized controllers in registration order
    pub async fn controllers(&self) -> Result<Vec<Arc<ServiceController>>, ShelfError> {
        self.materialize().await?;
        Ok(with_read_lock(&self.controllers, |controllers| controllers.clone()).await)
    }

    pub async fn hosted_service_count(&self) -> Result<usize, ShelfError> {
        Ok(self.controllers().await?.len())
    }

    /// Snapshot of every hosted service
    pub async fn service_info(&self) -> Result<Vec<ServiceInfo>, ShelfError> {
        Ok(self
            .controllers()
            .await?
            .iter()
            .map(|controller| ServiceInfo {
                name: controller.name().to_string(),
                state: controller.state(),
            })
            .collect())
    }

    pub async fn get_service(&self, name: &str) -> Result<Arc<ServiceController>, ShelfError> {
        self.controllers()
            .await?
            .into_iter()
            .find(|controller| controller.name() == name)
            .ok_or_else(|| ShelfError::ServiceNotFound(name.to_string()))
    }

    /// Broadcast `command` and wait for the services to converge on `target`
    ///
    /// `expected` is the event that counts a service as done; a fault or an
    /// unload event settles it without reaching the target.
    pub async fn apply_lifecycle_transition(
        &self,
        command: LifecycleCommand,
        expected: MessageKind,
        target: ServiceState,
        wait: Duration,
    ) -> Result<TransitionOutcome, ShelfError> {
        let controllers = self.controllers().await?;
        let pending: Vec<&Arc<ServiceController>> = controllers
            .iter()
            .filter(|controller| controller.state() != target)
            .collect();
        if pending.is_empty() {
            debug!("All services already {}", target);
            return Ok(TransitionOutcome::Converged);
        }

        // subscribe before broadcasting so no answer is missed
        let mut events = self.events.subscribe();
        let mut remaining: HashSet<String> = HashSet::new();
        info!("Sending {} to {} services", command, pending.len());
        for controller in &pending {
            match controller.send_command(command) {
                Ok(()) => {
                    remaining.insert(controller.name().to_string());
                }
                Err(e) => warn!("Could not {} {}: {}", command, controller.name(), e),
            }
        }

        let countdown = async {
            while !remaining.is_empty() {
                match events.recv().await {
                    Ok(message) => {
                        let settles = message.kind() == expected
                            || matches!(
                                message.kind(),
                                MessageKind::ServiceFault | MessageKind::ServiceUnloaded
                            );
                        if settles && remaining.remove(message.service_name()) {
                            debug!(
                                "{} settled with {:?}, {} remaining",
                                message.service_name(),
                                message.kind(),
                                remaining.len()
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} events, re-reading service states", skipped);
                        remaining.retain(|name| {
                            controllers
                                .iter()
                                .any(|c| c.name() == name && c.state() != target)
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        let timed_out = timeout(wait, countdown).await.is_err();

        let hosted = controllers.len();
        let lagging: Vec<String> = controllers
            .iter()
            .filter(|controller| controller.state() != target)
            .map(|controller| controller.name().to_string())
            .collect();
        let reached = hosted - lagging.len();

        match judge_transition(hosted, reached, timed_out) {
            TransitionVerdict::Converged => {
                info!("All {} services are {}", hosted, target);
                Ok(TransitionOutcome::Converged)
            }
            TransitionVerdict::Degraded => {
                warn!(
                    "{} of {} services are {}; lagging: {}",
                    reached,
                    hosted,
                    target,
                    lagging.join(", ")
                );
                Ok(TransitionOutcome::Degraded { lagging })
            }
            TransitionVerdict::TimedOut => {
                error!("Timed out waiting for services to {}", command);
                Err(ShelfError::LifecycleTimeout {
                    operation: command,
                    source: self.faults.oldest().await,
                })
            }
            TransitionVerdict::AllFailed => {
                error!("No service managed to {}", command);
                Err(ShelfError::AllServicesFailed {
                    operation: command,
                    source: self.faults.oldest().await,
                })
            }
        }
    }

    /// Create the worker of every service that has none
    ///
    /// Creation failures are reported as faults and leave the service unloaded;
    /// returns how many services were created.
    pub async fn create_services(&self) -> Result<usize, ShelfError> {
        let controllers = self.controllers().await?;
        let creating: Vec<&Arc<ServiceController>> = controllers
            .iter()
            .filter(|controller| controller.state() == ServiceState::Unloaded)
            .collect();
        let results = join_all(creating.iter().map(|controller| controller.create())).await;

        let mut created = 0;
        for (controller, result) in creating.iter().zip(results) {
            match result {
                Ok(()) => created += 1,
                Err(e) => warn!("Service {} was not created: {}", controller.name(), e),
            }
        }
        Ok(created)
    }

    /// Create and start every service
    pub async fn start(&self) -> Result<TransitionOutcome, ShelfError> {
        self.run_hook(self.hooks.before_starting.as_ref(), "before starting");
        self.create_services().await?;
        let outcome = self
            .apply_lifecycle_transition(
                LifecycleCommand::Start,
                MessageKind::ServiceRunning,
                ServiceState::Running,
                self.transition_timeout,
            )
            .await?;
        self.run_hook(self.hooks.after_starting.as_ref(), "after starting");
        Ok(outcome)
    }

    /// Stop every service
    pub async fn stop(&self) -> Result<TransitionOutcome, ShelfError> {
        let outcome = self
            .apply_lifecycle_transition(
                LifecycleCommand::Stop,
                MessageKind::ServiceStopped,
                ServiceState::Stopped,
                self.transition_timeout,
            )
            .await?;
        self.run_hook(self.hooks.after_stopping.as_ref(), "after stopping");
        Ok(outcome)
    }

    pub async fn pause(&self) -> Result<TransitionOutcome, ShelfError> {
        self.apply_lifecycle_transition(
            LifecycleCommand::Pause,
            MessageKind::ServicePaused,
            ServiceState::Paused,
            self.transition_timeout,
        )
        .await
    }

    /// Continue every paused service
    pub async fn resume(&self) -> Result<TransitionOutcome, ShelfError> {
        self.apply_lifecycle_transition(
            LifecycleCommand::Continue,
            MessageKind::ServiceRunning,
            ServiceState::Running,
            self.transition_timeout,
        )
        .await
    }

    /// Start one service, creating its worker first if needed
    pub async fn start_service(&self, name: &str) -> Result<(), ShelfError> {
        let controller = self.get_service(name).await?;
        if controller.state() == ServiceState::Unloaded {
            controller.create().await?;
        }
        controller.start()
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), ShelfError> {
        self.get_service(name).await?.stop()
    }

    pub async fn pause_service(&self, name: &str) -> Result<(), ShelfError> {
        self.get_service(name).await?.pause()
    }

    pub async fn continue_service(&self, name: &str) -> Result<(), ShelfError> {
        self.get_service(name).await?.resume()
    }

    /// Unload every service, last registered first
    pub async fn unload_services(&self) -> Result<Vec<(String, UnloadReason)>, ShelfError> {
        let mut unloaded = Vec::new();
        for controller in self.controllers().await?.iter().rev() {
            match controller.unload().await {
                Ok(reason) => unloaded.push((controller.name().to_string(), reason)),
                Err(e) => warn!("Failed to unload {}: {}", controller.name(), e),
            }
        }
        Ok(unloaded)
    }

    /// Register the fault handler, replacing any previous one
    pub async fn on_fault<F>(&self, handler: F)
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        let handler: FaultHandler = Arc::new(handler);
        self.faults.set_handler(handler).await;
    }

    /// Dequeue the oldest fault
    pub async fn next_fault(&self) -> Option<Fault> {
        self.faults.next().await
    }

    pub async fn drain_faults(&self) -> Vec<Fault> {
        self.faults.drain().await
    }

    /// Number of faults still queued
    pub async fn fault_count(&self) -> usize {
        self.faults.len().await
    }

    /// Feed of every event the coordinator receives
    pub fn subscribe_events(&self) -> broadcast::Receiver<ShelfMessage> {
        self.events.subscribe()
    }

    /// Unload every service, release the controllers and stop the mailbox
    pub async fn shutdown(&self) {
        if let Err(e) = self.unload_services().await {
            warn!("Failed to unload services during shutdown: {}", e);
        }
        let controllers: Vec<Arc<ServiceController>> =
            std::mem::take(&mut *self.controllers.write().await);
        for controller in controllers {
            controller.dispose().await;
        }
        if let Some(mailbox) = self.mailbox.lock().await.take() {
            mailbox.shutdown().await;
        }
        info!("Coordinator shut down");
    }

    fn run_hook(&self, hook: Option<&CoordinatorHook>, label: &str) {
        if let Some(hook) = hook {
            debug!("Calling {} hook", label);
            hook(self);
            info!("Completed {} hook", label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_service_timeout_fails() {
        assert_eq!(judge_transition(1, 0, true), TransitionVerdict::TimedOut);
        assert_eq!(judge_transition(1, 1, true), TransitionVerdict::TimedOut);
    }

    #[test]
    fn test_partial_convergence_is_degraded() {
        assert_eq!(judge_transition(5, 4, true), TransitionVerdict::Degraded);
        assert_eq!(judge_transition(5, 4, false), TransitionVerdict::Degraded);
    }

    #[test]
    fn test_nobody_reached_target() {
        assert_eq!(judge_transition(5, 0, false), TransitionVerdict::AllFailed);
        assert_eq!(judge_transition(5, 0, true), TransitionVerdict::TimedOut);
    }

    proptest! {
        #[test]
        fn prop_verdict_follows_policy(
            hosted in 1usize..64,
            reached_seed in 0usize..64,
            timed_out in any::<bool>(),
        ) {
            let reached = reached_seed % (hosted + 1);
            let verdict = judge_transition(hosted, reached, timed_out);

            if timed_out && (hosted == 1 || reached == 0) {
                prop_assert_eq!(verdict, TransitionVerdict::TimedOut);
            } else if reached == 0 {
                prop_assert_eq!(verdict, TransitionVerdict::AllFailed);
            } else if reached == hosted {
                prop_assert_eq!(verdict, TransitionVerdict::Converged);
            } else {
                prop_assert_eq!(verdict, TransitionVerdict::Degraded);
                prop_assert!(hosted > 1);
            }
        }

        #[test]
        fn prop_untimed_wait_never_times_out(hosted in 1usize..64, reached_seed in 0usize..64) {
            let reached = reached_seed % (hosted + 1);
            prop_assert_ne!(judge_transition(hosted, reached, false), TransitionVerdict::TimedOut);
        }
    }
}
