//! Services shipped with the host

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;

use crate::shelf::traits::{Bootstrapper, Service, ShelfContext};

/// Bootstrapper id of the heartbeat service
pub const HEARTBEAT_BOOTSTRAPPER: &str = "heartbeat";

/// Module id that makes the heartbeat tick every 100 ms instead of every second
pub const FAST_TICK_MODULE: &str = "fast-tick";

/// Logs a heartbeat at a fixed interval while running
pub struct HeartbeatService {
    service_name: String,
    interval: Duration,
    beats: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    pub fn new(service_name: impl Into<String>, interval: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            interval,
            beats: Arc::new(AtomicU64::new(0)),
            ticker: None,
        }
    }

    /// Number of beats emitted so far
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    fn resume_ticking(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let service_name = self.service_name.clone();
        let interval = self.interval;
        let beats = Arc::clone(&self.beats);
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let beat = beats.fetch_add(1, Ordering::Relaxed) + 1;
                info!("{} heartbeat #{}", service_name, beat);
            }
        }));
    }

    fn halt_ticking(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl Service for HeartbeatService {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.resume_ticking();
        Ok(())
    }

    async fn on_stop(&mut self) -> anyhow::Result<()> {
        self.halt_ticking();
        Ok(())
    }

    async fn on_pause(&mut self) -> anyhow::Result<()> {
        self.halt_ticking();
        Ok(())
    }

    async fn on_continue(&mut self) -> anyhow::Result<()> {
        self.resume_ticking();
        Ok(())
    }

    async fn on_unload(&mut self) -> anyhow::Result<()> {
        self.halt_ticking();
        Ok(())
    }
}

impl Drop for HeartbeatService {
    fn drop(&mut self) {
        self.halt_ticking();
    }
}

pub struct HeartbeatBootstrapper;

#[async_trait]
impl Bootstrapper for HeartbeatBootstrapper {
    async fn bootstrap(&self, context: ShelfContext) -> anyhow::Result<Box<dyn Service>> {
        let interval = if context.has_module(FAST_TICK_MODULE) {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(1)
        };
        Ok(Box::new(HeartbeatService::new(context.service_name, interval)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_only_while_running() {
        let mut service = HeartbeatService::new("clock", Duration::from_secs(1));

        service.on_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let running_beats = service.beats();
        assert!(running_beats >= 2);

        service.on_pause().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(service.beats(), running_beats);

        service.on_continue().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(service.beats() > running_beats);

        service.on_stop().await.unwrap();
    }
}
