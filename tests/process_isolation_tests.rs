//! External-process isolation tests
//!
//! These launch the `shelf-host` binary built alongside the tests as the
//! worker executable.

#![cfg(unix)]

use shelf_host::shelf::builtin::{FAST_TICK_MODULE, HEARTBEAT_BOOTSTRAPPER};
use shelf_host::shelf::process::ShelfProcessSpawner;
use shelf_host::shelf::{
    BootstrapperRegistry, IsolationLevel, IsolationSettings, ServiceController,
    ServiceCoordinator, ServiceDescriptor, ServiceState, ShelfError, ShelfMessage, UnloadReason,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn process_settings(executable: &Path, sockets: &TempDir) -> IsolationSettings {
    IsolationSettings::new(
        Arc::new(BootstrapperRegistry::with_builtins()),
        Arc::new(ShelfProcessSpawner::new(executable, sockets.path())),
    )
    .with_create_timeout(WAIT)
    .with_unload_timeout(Duration::from_secs(3))
}

async fn host(settings: IsolationSettings, descriptor: ServiceDescriptor) -> ServiceCoordinator {
    let coordinator = ServiceCoordinator::new(WAIT, settings).unwrap();
    coordinator
        .register_controllers(vec![ServiceController::factory(descriptor)])
        .await;
    coordinator
}

fn heartbeat(name: &str) -> ServiceDescriptor {
    ServiceDescriptor::new(name, IsolationLevel::ExternalProcess)
        .with_bootstrapper(HEARTBEAT_BOOTSTRAPPER)
        .with_module(FAST_TICK_MODULE)
}

#[tokio::test]
async fn test_heartbeat_in_worker_process() {
    let sockets = TempDir::new().unwrap();
    let settings = process_settings(Path::new(env!("CARGO_BIN_EXE_shelf-host")), &sockets);
    let coordinator = host(settings, heartbeat("pulse")).await;
    let mut events = coordinator.subscribe_events();

    coordinator.start().await.unwrap();
    let controller = coordinator.get_service("pulse").await.unwrap();
    assert_eq!(controller.state(), ServiceState::Running);

    let mut announced = None;
    while let Ok(event) = events.try_recv() {
        if let ShelfMessage::WorkerListening { address, .. } = event {
            announced = Some(address);
        }
    }
    assert!(announced.is_some_and(|address| address.starts_with("pid://")));

    let info = controller.reference_info().await.unwrap().unwrap();
    assert_eq!(info.isolation, IsolationLevel::ExternalProcess);
    assert!(info.live);
    assert!(info.address.unwrap().starts_with("pid://"));
    assert_eq!(info.modules, vec![FAST_TICK_MODULE.to_string()]);

    coordinator.stop().await.unwrap();
    assert_eq!(controller.unload().await.unwrap(), UnloadReason::Requested);
    assert!(coordinator.drain_faults().await.is_empty());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_missing_executable_fails_creation() {
    let sockets = TempDir::new().unwrap();
    let settings = process_settings(Path::new("/nonexistent/shelf-host"), &sockets);
    let coordinator = host(settings, heartbeat("pulse")).await;
    let controller = coordinator.get_service("pulse").await.unwrap();

    assert!(matches!(
        controller.create().await,
        Err(ShelfError::WorkerCreation { .. })
    ));
    assert_eq!(controller.state(), ServiceState::Unloaded);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_unknown_bootstrapper_in_worker_process() {
    let sockets = TempDir::new().unwrap();
    let settings = process_settings(Path::new(env!("CARGO_BIN_EXE_shelf-host")), &sockets);
    let descriptor = ServiceDescriptor::new("ghost", IsolationLevel::ExternalProcess)
        .with_bootstrapper("no-such-bootstrapper");
    let coordinator = host(settings, descriptor).await;
    let controller = coordinator.get_service("ghost").await.unwrap();

    match controller.create().await {
        Err(ShelfError::WorkerCreation { bootstrapper, .. }) => {
            assert_eq!(bootstrapper.as_deref(), Some("no-such-bootstrapper"));
        }
        other => panic!("expected a creation error, got {:?}", other),
    }
    assert_eq!(controller.state(), ServiceState::Unloaded);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_killed_worker_reports_one_fault() {
    let sockets = TempDir::new().unwrap();
    let settings = process_settings(Path::new(env!("CARGO_BIN_EXE_shelf-host")), &sockets);
    let coordinator = host(settings, heartbeat("pulse")).await;

    coordinator.start().await.unwrap();
    let controller = coordinator.get_service("pulse").await.unwrap();
    let address = controller
        .reference_info()
        .await
        .unwrap()
        .and_then(|info| info.address)
        .unwrap();
    let pid = address.trim_start_matches("pid://");

    let status = std::process::Command::new("kill")
        .args(["-9", pid])
        .status()
        .unwrap();
    assert!(status.success());

    controller
        .wait_for_state(ServiceState::Faulted, WAIT)
        .await
        .unwrap();
    // both the monitor and the closed channel notice the exit
    tokio::time::sleep(Duration::from_millis(500)).await;

    let faults = coordinator.drain_faults().await;
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        faults[0].error.as_ref(),
        ShelfError::WorkerExited { service, .. } if service == "pulse"
    ));
    coordinator.shutdown().await;
}
