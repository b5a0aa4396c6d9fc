//! Endpoint mailboxes
//!
//! Every controller and the coordinator own an inbox: an unbounded queue of
//! messages processed one at a time by a dedicated task, dispatched to the
//! handler registered for the message's route. Routes without a handler are
//! dropped; a panicking handler is logged and the mailbox keeps running.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::shelf::traits::ShelfError;

/// A message that can be routed to a handler by its kind
pub trait Routed: Send + 'static {
    type Route: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn route(&self) -> Self::Route;
}

type Handler<S, M> = Box<dyn for<'a> FnMut(&'a mut S, M) -> BoxFuture<'a, ()> + Send>;

/// Sending half of an endpoint
pub struct Address<M> {
    endpoint: Arc<str>,
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Address<M> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            tx: self.tx.clone(),
        }
    }
}

impl<M> Debug for Address<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<M: Send + 'static> Address<M> {
    /// Name of the endpoint this address delivers to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Enqueue a message; never waits on the receiver
    pub fn send(&self, message: M) -> Result<(), ShelfError> {
        self.tx
            .send(message)
            .map_err(|_| ShelfError::EndpointClosed(self.endpoint.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Address that accepts `N` and wraps it into this endpoint's message type
    pub fn recipient<N: 'static>(&self, wrap: fn(N) -> M) -> Recipient<N> {
        let address = self.clone();
        Recipient(Arc::new(move |message| address.send(wrap(message))))
    }
}

/// Type-erased sending half, used where the sender must not know the receiver's message type
pub struct Recipient<N>(Arc<dyn Fn(N) -> Result<(), ShelfError> + Send + Sync>);

impl<N> Clone for Recipient<N> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<N> Recipient<N> {
    pub fn send(&self, message: N) -> Result<(), ShelfError> {
        (self.0)(message)
    }
}

impl<N> Debug for Recipient<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Recipient")
    }
}

/// Receiving half of an endpoint, before it starts processing
pub struct Inbox<S, M: Routed> {
    endpoint: Arc<str>,
    rx: mpsc::UnboundedReceiver<M>,
    handlers: HashMap<M::Route, Handler<S, M>>,
}

impl<S: Send + 'static, M: Routed> Inbox<S, M> {
    /// Create an endpoint named `endpoint`
    pub fn new(endpoint: impl Into<Arc<str>>) -> (Address<M>, Self) {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Address {
                endpoint: Arc::clone(&endpoint),
                tx,
            },
            Self {
                endpoint,
                rx,
                handlers: HashMap::new(),
            },
        )
    }

    /// Register the handler for one route
    ///
    /// At most one handler may be registered per route.
    pub fn subscribe<F>(&mut self, route: M::Route, handler: F) -> Result<&mut Self, ShelfError>
    where
        F: for<'a> FnMut(&'a mut S, M) -> BoxFuture<'a, ()> + Send + 'static,
    {
        if self.handlers.contains_key(&route) {
            return Err(ShelfError::DuplicateHandler {
                endpoint: self.endpoint.to_string(),
                route: format!("{:?}", route),
            });
        }
        self.handlers.insert(route, Box::new(handler));
        Ok(self)
    }

    /// Start processing messages against `state`
    pub fn spawn(self, state: S) -> Mailbox<S> {
        let cancel = CancellationToken::new();
        let endpoint = Arc::clone(&self.endpoint);
        let task = tokio::spawn(self.run(state, cancel.clone()));
        Mailbox {
            endpoint,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self, mut state: S, cancel: CancellationToken) -> S {
        debug!("Endpoint {} started", self.endpoint);
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let route = message.route();
            let Some(handler) = self.handlers.get_mut(&route) else {
                trace!("Endpoint {} ignoring {:?}", self.endpoint, route);
                continue;
            };

            if let Err(panic) = AssertUnwindSafe(handler(&mut state, message))
                .catch_unwind()
                .await
            {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    "Handler for {:?} on endpoint {} panicked: {}",
                    route, self.endpoint, detail
                );
            }
        }
        debug!("Endpoint {} stopped", self.endpoint);
        state
    }
}

/// A running endpoint
///
/// Dropping the mailbox stops it after the message currently being handled.
pub struct Mailbox<S> {
    endpoint: Arc<str>,
    cancel: CancellationToken,
    task: Option<JoinHandle<S>>,
}

impl<S> Mailbox<S> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop processing and hand back the endpoint's state
    ///
    /// Returns `None` when the task was already gone.
    pub async fn shutdown(mut self) -> Option<S> {
        self.cancel.cancel();
        let task = self.task.take()?;
        match task.await {
            Ok(state) => Some(state),
            Err(e) => {
                error!("Endpoint {} task failed: {}", self.endpoint, e);
                None
            }
        }
    }
}

impl<S> Drop for Mailbox<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
