//! Health reporter behavior across the dispatcher's lifecycle.

use std::{sync::Arc, time::Duration};

use eventpub_core::TestClock;
use eventpub_dispatch::{
    storage::mock::{Failure, MockConnector, MockPublishStorage, Operation},
    Connection, DispatchConfig, DispatchError, Dispatcher, EventProcessor, Registry, RunMode,
};

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            "noop",
            EventProcessor::new()
                .on_initialize(|_| async { Ok(()) })
                .on_process(|_, _| async { Ok(()) }),
        )
        .unwrap();
    registry
}

async fn connected(storage: &MockPublishStorage) -> Dispatcher {
    let clock = TestClock::new();
    let dispatcher =
        Dispatcher::new(registry(), DispatchConfig::default(), Arc::new(clock.clone()));
    let connection = Connection::establish(
        Arc::new(MockConnector::new(storage.clone())),
        1,
        Duration::from_secs(1),
        Arc::new(clock),
    )
    .await
    .unwrap();
    dispatcher.set_connection(connection).await;
    dispatcher
}

#[tokio::test]
async fn connected_dispatcher_is_healthy() {
    let storage = MockPublishStorage::new();
    let dispatcher = connected(&storage).await;
    let health = dispatcher.health_reporter();

    dispatcher.process_events(RunMode::SinglePass).await.unwrap();

    assert!(health.is_healthy().await);
    assert!(health.is_connection_healthy().await);
    assert_eq!(health.exit_error().await, None);
    assert_eq!(health.stats().await.passes, 1);
}

#[tokio::test]
async fn unconnected_dispatcher_is_unhealthy() {
    let dispatcher = Dispatcher::new(registry(), DispatchConfig::default(), Arc::new(TestClock::new()));
    let health = dispatcher.health_reporter();

    assert!(!health.is_connection_healthy().await);
    assert!(!health.is_healthy().await);
}

#[tokio::test]
async fn unreachable_database_is_unhealthy() {
    let storage = MockPublishStorage::new();
    let dispatcher = connected(&storage).await;
    let health = dispatcher.health_reporter();

    storage.set_ping_healthy(false);

    assert!(!health.is_healthy().await);
    assert_eq!(health.exit_error().await, None);

    storage.set_ping_healthy(true);
    assert!(health.is_healthy().await);
}

#[tokio::test]
async fn exhausted_budget_stays_unhealthy_while_database_answers() {
    let storage = MockPublishStorage::new();
    let dispatcher = connected(&storage).await;
    let health = dispatcher.health_reporter();
    storage.fail_next(Operation::Begin, Failure::Query, 101);

    let err = dispatcher.process_events(RunMode::Loop).await.unwrap_err();

    assert!(health.is_connection_healthy().await);
    assert!(!health.is_healthy().await);
    assert_eq!(health.exit_error().await, Some(err));
    assert!(matches!(
        health.exit_error().await,
        Some(DispatchError::ErrorBudgetExhausted { consecutive_errors: 101, .. })
    ));
}
