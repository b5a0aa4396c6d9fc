//! shelf-host binary
//!
//! Usage:
//!   shelf-host run --config <file>
//!   shelf-host shelf --uri <socket> --pipe <name> --service-name <name> [--bootstrapper <id>] [--module <id>]...
//!
//! `run` hosts the configured services until SIGINT/SIGTERM. `shelf` is how
//! the host launches itself as an external-process worker.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

use shelf_host::config::HostConfig;
use shelf_host::shelf::{BootstrapperRegistry, CoordinatorHooks, ServiceCoordinator};
use shelf_host::utils::{init_logging, init_logging_from_config, wait_for_shutdown_signal};

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "shelf-host", version, about = "Host isolated services under one supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the services listed in a configuration file
    Run {
        /// Configuration file (TOML, or JSON with a .json extension)
        #[arg(long, short)]
        config: PathBuf,

        /// Log filter, overrides the config file (RUST_LOG still wins)
        #[arg(long)]
        log_filter: Option<String>,
    },
    /// Run one service as a worker process (launched by the host)
    #[cfg(unix)]
    Shelf(shelf_host::shelf::worker::ShelfArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_filter } => run_host(config, log_filter).await,
        #[cfg(unix)]
        Command::Shelf(args) => {
            let _span = shelf_host::utils::init_shelf_logging(&args.service_name, None);
            let registry = BootstrapperRegistry::with_builtins();
            shelf_host::shelf::worker::run_shelf_process(args, &registry)
                .await
                .context("worker process failed")
        }
    }
}

async fn run_host(config_path: PathBuf, log_filter: Option<String>) -> anyhow::Result<()> {
    let config = HostConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;

    match log_filter.as_deref() {
        Some(filter) => init_logging(Some(filter)),
        None => init_logging_from_config(config.logging.as_ref()),
    }
    info!(
        "Hosting {} services from {:?}",
        config.services.len(),
        config_path
    );

    let settings = config.isolation_settings(BootstrapperRegistry::with_builtins())?;
    let hooks = CoordinatorHooks::new()
        .before_starting(|_| info!("Starting hosted services"))
        .after_stopping(|_| info!("Hosted services stopped"));
    let coordinator =
        ServiceCoordinator::new(config.coordinator.transition_timeout(), settings)?.with_hooks(hooks);
    coordinator
        .register_controllers(config.controller_factories())
        .await;
    coordinator
        .on_fault(|fault| error!("Fault reported: {}", fault))
        .await;

    let started = coordinator.start().await;
    match &started {
        Ok(outcome) => info!("Services started: {:?}", outcome),
        Err(e) => error!("Failed to start services: {}", e),
    }

    if started.is_ok() {
        let signal = wait_for_shutdown_signal().await;
        info!("Received {}, stopping hosted services", signal);
        if let Err(e) = coordinator.stop().await {
            warn!("Failed to stop services cleanly: {}", e);
        }
    }

    coordinator.shutdown().await;
    // each fault was already logged by the handler as it arrived
    let recorded = coordinator.fault_count().await;
    if recorded > 0 {
        warn!("{} faults recorded during this run", recorded);
    }
    started.map(|_| ()).map_err(anyhow::Error::from)
}
