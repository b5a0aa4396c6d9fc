//! Shared fixtures for integration tests
//!
//! `ScriptedBootstrapper` builds services whose lifecycle hooks behave
//! according to a script, so tests can make a service acknowledge, fail,
//! panic or never answer on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use shelf_host::shelf::{
    Bootstrapper, BootstrapperRegistry, ControllerFactory, IsolationLevel, IsolationSettings,
    Service, ServiceController, ServiceCoordinator, ServiceDescriptor, ShelfContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a scripted lifecycle hook answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ack,
    Fail,
    Panic,
    /// Never returns
    Silent,
}

impl Step {
    async fn play(self, hook: &str) -> anyhow::Result<()> {
        match self {
            Step::Ack => Ok(()),
            Step::Fail => anyhow::bail!("{} refused", hook),
            Step::Panic => panic!("{} blew up", hook),
            Step::Silent => futures::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub start: Step,
    pub stop: Step,
    pub hang_bootstrap: bool,
}

impl Script {
    pub fn acking() -> Self {
        Self {
            start: Step::Ack,
            stop: Step::Ack,
            hang_bootstrap: false,
        }
    }

    pub fn on_start(mut self, step: Step) -> Self {
        self.start = step;
        self
    }

    pub fn on_stop(mut self, step: Step) -> Self {
        self.stop = step;
        self
    }

    pub fn hanging() -> Self {
        Self {
            hang_bootstrap: true,
            ..Self::acking()
        }
    }
}

struct ScriptedService {
    script: Script,
}

#[async_trait]
impl Service for ScriptedService {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.script.start.play("start").await
    }

    async fn on_stop(&mut self) -> anyhow::Result<()> {
        self.script.stop.play("stop").await
    }
}

pub struct ScriptedBootstrapper {
    script: Script,
}

#[async_trait]
impl Bootstrapper for ScriptedBootstrapper {
    async fn bootstrap(&self, _context: ShelfContext) -> anyhow::Result<Box<dyn Service>> {
        if self.script.hang_bootstrap {
            futures::future::pending::<()>().await;
        }
        Ok(Box::new(ScriptedService {
            script: self.script,
        }))
    }
}

/// Registry with the builtins plus one scripted bootstrapper per `(id, script)`
pub fn registry(scripts: &[(&str, Script)]) -> BootstrapperRegistry {
    let mut registry = BootstrapperRegistry::with_builtins();
    for (id, script) in scripts {
        registry.register(*id, ScriptedBootstrapper { script: *script });
    }
    registry
}

/// Settings with short timeouts suited to tests
pub fn settings(registry: BootstrapperRegistry) -> IsolationSettings {
    IsolationSettings::for_registry(registry)
        .with_create_timeout(Duration::from_secs(2))
        .with_unload_timeout(Duration::from_millis(300))
}

/// Sandboxed descriptor using bootstrapper `id`
pub fn sandboxed(name: &str, id: &str) -> ServiceDescriptor {
    ServiceDescriptor::new(name, IsolationLevel::Sandboxed).with_bootstrapper(id)
}

/// Coordinator hosting `descriptors` with the given transition timeout
pub async fn coordinator(
    registry: BootstrapperRegistry,
    descriptors: Vec<ServiceDescriptor>,
    transition_timeout: Duration,
) -> ServiceCoordinator {
    let coordinator = ServiceCoordinator::new(transition_timeout, settings(registry)).unwrap();
    coordinator
        .register_controllers(
            descriptors
                .into_iter()
                .map(ServiceController::factory)
                .collect(),
        )
        .await;
    coordinator
}

/// Wrap a factory so tests can count how often it is invoked
pub fn counted(descriptor: ServiceDescriptor, calls: Arc<AtomicUsize>) -> ControllerFactory {
    let inner = ServiceController::factory(descriptor);
    Box::new(move |context| {
        calls.fetch_add(1, Ordering::SeqCst);
        inner(context)
    })
}
