//! Fault queue
//!
//! Every fault the coordinator observes is enqueued here first, then handed
//! to the fault handler if one is registered. Faults are dequeued oldest
//! first; the queue is unbounded.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::shelf::traits::Fault;
use crate::utils::lock::{with_read_lock, with_write_lock};

/// Callback invoked synchronously for every reported fault
pub type FaultHandler = Arc<dyn Fn(&Fault) + Send + Sync>;

#[derive(Default)]
pub struct FaultQueue {
    faults: RwLock<VecDeque<Fault>>,
    handler: RwLock<Option<FaultHandler>>,
}

impl FaultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `fault`, then notify the handler
    ///
    /// A panicking handler is logged; the fault stays queued.
    pub async fn report(&self, fault: Fault) {
        with_write_lock(&self.faults, |faults| faults.push_back(fault.clone())).await;
        debug!("Queued fault for {}", fault.service_name);

        let handler = with_read_lock(&self.handler, |handler| handler.clone()).await;
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(&fault))).is_err() {
                error!(
                    "Fault handler panicked while handling fault from {}",
                    fault.service_name
                );
            }
        }
    }

    /// Replace the fault handler
    pub async fn set_handler(&self, handler: FaultHandler) {
        with_write_lock(&self.handler, |slot| *slot = Some(handler)).await;
    }

    pub async fn clear_handler(&self) {
        with_write_lock(&self.handler, |slot| *slot = None).await;
    }

    /// Oldest queued fault, left in place
    pub async fn oldest(&self) -> Option<Fault> {
        with_read_lock(&self.faults, |faults| faults.front().cloned()).await
    }

    /// Dequeue the oldest fault
    pub async fn next(&self) -> Option<Fault> {
        with_write_lock(&self.faults, |faults| faults.pop_front()).await
    }

    /// Dequeue every fault, oldest first
    pub async fn drain(&self) -> Vec<Fault> {
        with_write_lock(&self.faults, |faults| faults.drain(..).collect()).await
    }

    pub async fn len(&self) -> usize {
        with_read_lock(&self.faults, |faults| faults.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shelf::traits::ShelfError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fault(service: &str) -> Fault {
        Fault::new(service, ShelfError::ReferenceUnavailable(service.to_string()))
    }

    #[tokio::test]
    async fn test_faults_dequeued_oldest_first() {
        let queue = FaultQueue::new();
        queue.report(fault("first")).await;
        queue.report(fault("second")).await;

        assert_eq!(queue.oldest().await.unwrap().service_name, "first");
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.next().await.unwrap().service_name, "first");

        let rest = queue.drain().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].service_name, "second");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_handler_called_once_per_fault() {
        let queue = FaultQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        queue
            .set_handler(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        queue.report(fault("clock")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.drain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_fault() {
        let queue = FaultQueue::new();
        queue
            .set_handler(Arc::new(|_| panic!("alerting is down")))
            .await;

        queue.report(fault("clock")).await;
        assert_eq!(queue.len().await, 1);
    }
}
