//! Health and liveness endpoint tests.
//!
//! Covers the database check alone, the dispatcher check when a dispatcher
//! is attached, and the response shape of both endpoints.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use eventpub_api::{create_router, AppState, FeedSettings, MemoryFeedStore};
use eventpub_core::TestClock;
use eventpub_dispatch::{
    storage::mock::{MockConnector, MockPublishStorage},
    Connection, DispatchConfig, Dispatcher, EventProcessor, Registry,
};
use serde_json::Value;
use tower::ServiceExt;

fn state(store: &MemoryFeedStore) -> AppState {
    AppState::new(
        Arc::new(store.clone()),
        Arc::new(TestClock::new()),
        FeedSettings::new("http://localhost:4000/notifications", "Event store feed"),
    )
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.expect("failed to make request");

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let json = serde_json::from_slice(&body).expect("response should be valid JSON");

    (status, json)
}

async fn dispatcher(publish: &MockPublishStorage) -> Dispatcher {
    let mut registry = Registry::new();
    registry
        .register(
            "noop",
            EventProcessor::new()
                .on_initialize(|_| async { Ok(()) })
                .on_process(|_, _| async { Ok(()) }),
        )
        .unwrap();

    let clock = TestClock::new();
    let dispatcher =
        Dispatcher::new(registry, DispatchConfig::default(), Arc::new(clock.clone()));
    let connection = Connection::establish(
        Arc::new(MockConnector::new(publish.clone())),
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
async fn health_check_returns_success_when_healthy() {
    let store = MemoryFeedStore::new();
    let app = create_router(state(&store), Duration::from_secs(30));

    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "up");
    assert!(body["checks"].get("dispatcher").is_none());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn database_failure_is_service_unavailable() {
    let store = MemoryFeedStore::new();
    store.set_healthy(false);
    let app = create_router(state(&store), Duration::from_secs(30));

    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "down");
    let message = body["checks"]["database"]["message"].as_str().unwrap();
    assert!(message.contains("Database connection failed"), "message: {message}");
}

#[tokio::test]
async fn attached_dispatcher_is_reported() {
    let store = MemoryFeedStore::new();
    let publish = MockPublishStorage::new();
    let dispatcher = dispatcher(&publish).await;
    let app = create_router(
        state(&store).with_dispatcher(dispatcher.health_reporter()),
        Duration::from_secs(30),
    );

    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["dispatcher"]["status"], "up");
}

#[tokio::test]
async fn dispatcher_connection_loss_is_service_unavailable() {
    let store = MemoryFeedStore::new();
    let publish = MockPublishStorage::new();
    let dispatcher = dispatcher(&publish).await;
    publish.set_ping_healthy(false);
    let app = create_router(
        state(&store).with_dispatcher(dispatcher.health_reporter()),
        Duration::from_secs(30),
    );

    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["database"]["status"], "up");
    assert_eq!(body["checks"]["dispatcher"]["status"], "down");
}

#[tokio::test]
async fn liveness_ignores_dependencies() {
    let store = MemoryFeedStore::new();
    store.set_healthy(false);
    let app = create_router(state(&store), Duration::from_secs(30));

    let (status, body) = get_json(app, "/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "eventpub");
}
