//! Worker runtime
//!
//! Runs on the far side of an isolation boundary: builds the service through
//! its bootstrapper, announces the channel, then executes lifecycle commands
//! one at a time and answers each with an acknowledgment or a fault. Errors
//! and panics raised by the service are converted into fault messages here and
//! never unwind into the host.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::shelf::channel::protocol::{FaultReport, FaultStage, LifecycleCommand, ShelfMessage};
use crate::shelf::ipc::link::FrameLink;
use crate::shelf::traits::{Bootstrapper, Service, ShelfContext};

/// Identity a worker announces once its service is built
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub address: String,
    pub channel_name: String,
    /// Bootstrapper id, echoed in creation faults
    pub bootstrapper: Option<String>,
}

/// Build the service and serve lifecycle commands until unloaded or disconnected
pub async fn host_shelf(
    context: ShelfContext,
    bootstrapper: Arc<dyn Bootstrapper>,
    identity: WorkerIdentity,
    link: FrameLink,
) {
    let service_name = context.service_name.clone();
    debug!("Bootstrapping service {}", service_name);

    let built = AssertUnwindSafe(bootstrapper.bootstrap(context))
        .catch_unwind()
        .await;
    let service = match built {
        Ok(Ok(service)) => service,
        Ok(Err(e)) => {
            error!("Bootstrapper for {} failed: {:#}", service_name, e);
            let report = FaultReport::from_anyhow(FaultStage::Creation, &e);
            fail_creation(&service_name, report, identity.bootstrapper, link).await;
            return;
        }
        Err(panic) => {
            error!("Bootstrapper for {} panicked", service_name);
            let report = FaultReport::panicked(FaultStage::Creation, panic);
            fail_creation(&service_name, report, identity.bootstrapper, link).await;
            return;
        }
    };

    let announcement = ShelfMessage::WorkerListening {
        service_name: service_name.clone(),
        address: identity.address,
        channel_name: identity.channel_name,
    };
    if let Err(e) = link.send(&announcement) {
        warn!("Host went away before {} could announce itself: {}", service_name, e);
        return;
    }

    ShelfWorker {
        service_name,
        service,
        link,
    }
    .run()
    .await;
}

/// Report a creation failure to the host and close the link
pub async fn fail_creation(
    service_name: &str,
    mut report: FaultReport,
    bootstrapper: Option<String>,
    link: FrameLink,
) {
    if report.bootstrapper.is_none() {
        report.bootstrapper = bootstrapper;
    }
    let message = ShelfMessage::ServiceFault {
        service_name: service_name.to_string(),
        fault: report,
    };
    if let Err(e) = link.send(&message) {
        warn!("Could not report creation failure for {}: {}", service_name, e);
    }
    link.close().await;
}

enum Step {
    Lifecycle(LifecycleCommand),
    Unload,
}

struct ShelfWorker {
    service_name: String,
    service: Box<dyn Service>,
    link: FrameLink,
}

impl ShelfWorker {
    async fn run(mut self) {
        info!("Worker for {} ready", self.service_name);

        while let Some(frame) = self.link.recv().await {
            let message = match frame {
                Ok(message) => message,
                Err(e) => {
                    warn!("Worker for {} dropped a frame: {}", self.service_name, e);
                    continue;
                }
            };

            let step = match message {
                ShelfMessage::StartService { .. } => Step::Lifecycle(LifecycleCommand::Start),
                ShelfMessage::StopService { .. } => Step::Lifecycle(LifecycleCommand::Stop),
                ShelfMessage::PauseService { .. } => Step::Lifecycle(LifecycleCommand::Pause),
                ShelfMessage::ContinueService { .. } => {
                    Step::Lifecycle(LifecycleCommand::Continue)
                }
                ShelfMessage::UnloadService { .. } => Step::Unload,
                other => {
                    debug!(
                        "Worker for {} ignoring {:?}",
                        self.service_name,
                        other.kind()
                    );
                    continue;
                }
            };

            match step {
                Step::Lifecycle(command) => {
                    let reply = self.execute(command).await;
                    if self.link.send(&reply).is_err() {
                        break;
                    }
                }
                Step::Unload => {
                    self.unload().await;
                    break;
                }
            }
        }

        debug!("Worker for {} shutting down", self.service_name);
        self.link.close().await;
    }

    async fn execute(&mut self, command: LifecycleCommand) -> ShelfMessage {
        debug!("Worker for {} executing {}", self.service_name, command);
        let service = &mut self.service;
        let outcome = AssertUnwindSafe(async move {
            match command {
                LifecycleCommand::Start => service.on_start().await,
                LifecycleCommand::Stop => service.on_stop().await,
                LifecycleCommand::Pause => service.on_pause().await,
                LifecycleCommand::Continue => service.on_continue().await,
            }
        })
        .catch_unwind()
        .await;

        let fault = match outcome {
            Ok(Ok(())) => return command.acknowledgment(self.service_name.clone()),
            Ok(Err(e)) => FaultReport::from_anyhow(command.fault_stage(), &e),
            Err(panic) => FaultReport::panicked(command.fault_stage(), panic),
        };
        warn!(
            "Service {} failed to {}: {}",
            self.service_name, command, fault
        );
        ShelfMessage::ServiceFault {
            service_name: self.service_name.clone(),
            fault,
        }
    }

    async fn unload(&mut self) {
        let outcome = AssertUnwindSafe(self.service.on_unload())
            .catch_unwind()
            .await;
        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(FaultReport::from_anyhow(FaultStage::Unload, &e)),
            Err(panic) => Some(FaultReport::panicked(FaultStage::Unload, panic)),
        };
        if let Some(fault) = fault {
            warn!("Service {} failed to unload cleanly: {}", self.service_name, fault);
            let _ = self.link.send(&ShelfMessage::ServiceFault {
                service_name: self.service_name.clone(),
                fault,
            });
        }
        let _ = self.link.send(&ShelfMessage::WorkerUnloaded {
            service_name: self.service_name.clone(),
        });
        info!("Worker for {} unloaded", self.service_name);
    }
}

/// Arguments a worker process is launched with
#[cfg(unix)]
#[derive(Debug, Clone, clap::Args)]
pub struct ShelfArgs {
    /// Socket the host is listening on
    #[arg(long)]
    pub uri: std::path::PathBuf,

    /// Channel name assigned by the host
    #[arg(long)]
    pub pipe: String,

    /// Name of the service to host
    #[arg(long = "service-name")]
    pub service_name: String,

    /// Bootstrapper id (defaults to the service name)
    #[arg(long)]
    pub bootstrapper: Option<String>,

    /// Module to preload (repeatable)
    #[arg(long = "module")]
    pub modules: Vec<String>,
}

/// Entry point of a worker process
///
/// Connects back to the host, builds the service with `registry` and serves
/// it until the host unloads it or the connection drops.
#[cfg(unix)]
pub async fn run_shelf_process(
    args: ShelfArgs,
    registry: &crate::shelf::registry::BootstrapperRegistry,
) -> Result<(), crate::shelf::traits::ShelfError> {
    use crate::shelf::ipc::client;

    let link = client::connect(&args.uri).await?;
    let key = args
        .bootstrapper
        .clone()
        .unwrap_or_else(|| args.service_name.clone());

    let bootstrapper = match registry.resolve(&key) {
        Ok(bootstrapper) => bootstrapper,
        Err(e) => {
            let report = FaultReport::from_error(FaultStage::Creation, &e);
            fail_creation(&args.service_name, report, Some(key), link).await;
            return Err(e);
        }
    };

    let context = ShelfContext {
        service_name: args.service_name.clone(),
        working_dir: std::env::current_dir()?,
        modules: args.modules.clone(),
    };
    let identity = WorkerIdentity {
        address: format!("pid://{}", std::process::id()),
        channel_name: args.pipe,
        bootstrapper: args.bootstrapper,
    };
    host_shelf(context, bootstrapper, identity, link).await;
    Ok(())
}
