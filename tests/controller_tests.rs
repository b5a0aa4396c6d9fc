//! Service controller tests
//!
//! Lifecycle of a single service driven through its controller.

mod common;

use common::*;
use shelf_host::shelf::{MessageKind, ServiceState, ShelfError, ShelfMessage, UnloadReason};
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

/// Drain every transition already published
fn drain(transitions: &mut broadcast::Receiver<ServiceState>) -> Vec<ServiceState> {
    let mut seen = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        seen.push(state);
    }
    seen
}

#[tokio::test]
async fn test_full_lifecycle_state_sequence() {
    let coordinator = coordinator(
        registry(&[("ok", Script::acking())]),
        vec![sandboxed("alpha", "ok")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("alpha").await.unwrap();
    let mut transitions = controller.subscribe_transitions();

    controller.create().await.unwrap();
    controller.start().unwrap();
    controller.wait_for_state(ServiceState::Running, WAIT).await.unwrap();
    controller.pause().unwrap();
    controller.wait_for_state(ServiceState::Paused, WAIT).await.unwrap();
    controller.resume().unwrap();
    controller.wait_for_state(ServiceState::Running, WAIT).await.unwrap();
    controller.stop().unwrap();
    controller.wait_for_state(ServiceState::Stopped, WAIT).await.unwrap();
    assert_eq!(controller.unload().await.unwrap(), UnloadReason::Requested);

    assert_eq!(
        drain(&mut transitions),
        vec![
            ServiceState::Creating,
            ServiceState::Created,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Pausing,
            ServiceState::Paused,
            ServiceState::Continuing,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Stopped,
            ServiceState::Unloading,
            ServiceState::Unloaded,
        ]
    );
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_second_unload_is_already_unloaded() {
    let coordinator = coordinator(
        registry(&[("ok", Script::acking())]),
        vec![sandboxed("alpha", "ok")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("alpha").await.unwrap();

    controller.create().await.unwrap();
    assert!(controller.reference_info().await.unwrap().is_some());

    assert_eq!(controller.unload().await.unwrap(), UnloadReason::Requested);
    assert_eq!(
        controller.unload().await.unwrap(),
        UnloadReason::AlreadyUnloaded
    );
    assert!(controller.reference_info().await.unwrap().is_none());
    assert_eq!(controller.state(), ServiceState::Unloaded);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_hanging_bootstrap_times_out_creation() {
    let coordinator = coordinator(
        registry(&[("stuck", Script::hanging())]),
        vec![sandboxed("slowpoke", "stuck")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("slowpoke").await.unwrap();

    let result = controller.create().await;
    match result {
        Err(ShelfError::WorkerCreation {
            service,
            bootstrapper,
            ..
        }) => {
            assert_eq!(service, "slowpoke");
            assert_eq!(bootstrapper.as_deref(), Some("stuck"));
        }
        other => panic!("expected a creation error, got {:?}", other),
    }
    assert_eq!(controller.state(), ServiceState::Unloaded);
    assert!(controller.reference_info().await.unwrap().is_none());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_command_without_worker_reports_already_unloaded() {
    let coordinator = coordinator(
        registry(&[("ok", Script::acking())]),
        vec![sandboxed("alpha", "ok")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("alpha").await.unwrap();
    let mut events = coordinator.subscribe_events();

    controller.start().unwrap();

    let event = tokio::time::timeout(WAIT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ShelfMessage::ServiceUnloaded {
            service_name: "alpha".to_string(),
            reason: UnloadReason::AlreadyUnloaded,
        }
    );
    assert_eq!(controller.state(), ServiceState::Unloaded);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_faults_the_service() {
    let coordinator = coordinator(
        registry(&[("grumpy", Script::acking().on_start(Step::Fail))]),
        vec![sandboxed("grumpy", "grumpy")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("grumpy").await.unwrap();
    let mut events = coordinator.subscribe_events();

    controller.create().await.unwrap();
    controller.start().unwrap();
    controller.wait_for_state(ServiceState::Faulted, WAIT).await.unwrap();

    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ShelfMessage::ServiceFault { fault, .. } = event {
            assert!(fault.to_string().contains("start refused"));
            break;
        }
        assert_ne!(event.kind(), MessageKind::ServiceRunning);
    }
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_recreate_uses_new_generation() {
    let coordinator = coordinator(
        registry(&[("ok", Script::acking())]),
        vec![sandboxed("alpha", "ok")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("alpha").await.unwrap();

    controller.create().await.unwrap();
    let first = controller.reference_info().await.unwrap().unwrap();
    controller.unload().await.unwrap();

    controller.create().await.unwrap();
    let second = controller.reference_info().await.unwrap().unwrap();
    assert!(second.generation > first.generation);
    assert_ne!(second.channel_name, first.channel_name);

    controller.start().unwrap();
    controller.wait_for_state(ServiceState::Running, WAIT).await.unwrap();
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_failed_creates_report_every_fault() {
    let coordinator = coordinator(
        registry(&[]),
        vec![sandboxed("ghost", "no-such-bootstrapper")],
        WAIT,
    )
    .await;
    let controller = coordinator.get_service("ghost").await.unwrap();
    let mut events = coordinator.subscribe_events();

    let (first, second) = tokio::join!(controller.create(), controller.create());
    assert!(matches!(first, Err(ShelfError::WorkerCreation { .. })));
    assert!(matches!(second, Err(ShelfError::WorkerCreation { .. })));

    let mut relayed = 0;
    while relayed < 2 {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if event.kind() == MessageKind::ServiceFault {
            relayed += 1;
        }
    }

    let faults = coordinator.drain_faults().await;
    assert_eq!(faults.len(), 2);
    assert!(faults.iter().all(|fault| matches!(
        fault.error.as_ref(),
        ShelfError::WorkerCreation { service, .. } if service == "ghost"
    )));
    assert_eq!(controller.state(), ServiceState::Unloaded);
    coordinator.shutdown().await;
}
