//! Bootstrapper registry
//!
//! Maps bootstrapper ids to the factories that build a service's entry point.
//! The host consults it for sandboxed workers; a worker process consults its
//! own copy after it has been launched.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::shelf::builtin::{HeartbeatBootstrapper, HEARTBEAT_BOOTSTRAPPER};
use crate::shelf::traits::{Bootstrapper, Service, ShelfContext, ShelfError};

/// Registered bootstrappers by id
#[derive(Default, Clone)]
pub struct BootstrapperRegistry {
    bootstrappers: HashMap<String, Arc<dyn Bootstrapper>>,
}

impl BootstrapperRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bootstrappers shipped with the host
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(HEARTBEAT_BOOTSTRAPPER, HeartbeatBootstrapper);
        registry
    }

    /// Register a bootstrapper, replacing any previous one with the same id
    pub fn register<B>(&mut self, id: impl Into<String>, bootstrapper: B) -> &mut Self
    where
        B: Bootstrapper + 'static,
    {
        let id = id.into();
        debug!("Registering bootstrapper {}", id);
        self.bootstrappers.insert(id, Arc::new(bootstrapper));
        self
    }

    /// Register a synchronous constructor as a bootstrapper
    pub fn register_fn<F, S>(&mut self, id: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(ShelfContext) -> anyhow::Result<S> + Send + Sync + 'static,
        S: Service + 'static,
    {
        self.register(id, FnBootstrapper(build))
    }

    /// Look up a bootstrapper
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Bootstrapper>, ShelfError> {
        self.bootstrappers
            .get(id)
            .cloned()
            .ok_or_else(|| ShelfError::UnknownBootstrapper(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bootstrappers.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bootstrappers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for BootstrapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapperRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

struct FnBootstrapper<F>(F);

#[async_trait]
impl<F, S> Bootstrapper for FnBootstrapper<F>
where
    F: Fn(ShelfContext) -> anyhow::Result<S> + Send + Sync + 'static,
    S: Service + 'static,
{
    async fn bootstrap(&self, context: ShelfContext) -> anyhow::Result<Box<dyn Service>> {
        let service = (self.0)(context)?;
        Ok(Box::new(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Idle;

    #[async_trait]
    impl Service for Idle {
        async fn on_start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn context() -> ShelfContext {
        ShelfContext {
            service_name: "idle".to_string(),
            working_dir: PathBuf::from("."),
            modules: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_register_fn_and_resolve() {
        let mut registry = BootstrapperRegistry::new();
        registry.register_fn("idle", |_| Ok(Idle));

        let bootstrapper = registry.resolve("idle").unwrap();
        let mut service = bootstrapper.bootstrap(context()).await.unwrap();
        service.on_start().await.unwrap();
    }

    #[tokio::test]
    async fn test_constructor_error_propagates() {
        let mut registry = BootstrapperRegistry::new();
        registry.register_fn("broken", |_| -> anyhow::Result<Idle> {
            anyhow::bail!("missing settings")
        });

        let bootstrapper = registry.resolve("broken").unwrap();
        let error = bootstrapper.bootstrap(context()).await.err().unwrap();
        assert_eq!(error.to_string(), "missing settings");
    }

    #[test]
    fn test_unknown_id_rejected() {
        let registry = BootstrapperRegistry::with_builtins();
        assert!(registry.contains(HEARTBEAT_BOOTSTRAPPER));
        assert!(matches!(
            registry.resolve("nope"),
            Err(ShelfError::UnknownBootstrapper(id)) if id == "nope"
        ));
    }
}
