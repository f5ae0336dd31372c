//! Health check handlers for service monitoring.
//!
//! `/health` checks the feed database and, when one runs in-process, the
//! dispatcher's exit state and connection. `/live` never touches
//! dependencies.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use eventpub_core::Clock;
use eventpub_dispatch::HealthReporter;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::{feed_store::FeedStore, AppState};

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components up
    Healthy,
    /// At least one component down
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Feed database round trip
    pub database: ComponentHealth,
    /// In-process dispatcher, absent when none is attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher: Option<ComponentHealth>,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Health service that runs the component checks against an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks every component and folds the results into one status.
    pub async fn health_check(
        &self,
        feeds: &dyn FeedStore,
        dispatcher: Option<&HealthReporter>,
    ) -> HealthResponse {
        debug!("Performing health check");

        let timestamp = DateTime::<Utc>::from(self.clock.now_system());

        let database = self.check_database(feeds).await;
        let dispatcher = match dispatcher {
            Some(reporter) => Some(self.check_dispatcher(reporter).await),
            None => None,
        };

        let all_up = database.status == ComponentStatus::Up
            && dispatcher.as_ref().map_or(true, |d| d.status == ComponentStatus::Up);

        HealthResponse {
            status: if all_up { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
            timestamp,
            checks: HealthChecks { database, dispatcher },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_database(&self, feeds: &dyn FeedStore) -> ComponentHealth {
        let start = self.clock.now();
        let result = feeds.health_check().await;
        let response_time_ms = self.elapsed_ms(start);

        match result {
            Ok(()) => {
                debug!("Database health check passed");
                ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms }
            },
            Err(e) => {
                error!("Database health check failed: {}", e);
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("Database connection failed: {e}")),
                    response_time_ms,
                }
            },
        }
    }

    async fn check_dispatcher(&self, reporter: &HealthReporter) -> ComponentHealth {
        let start = self.clock.now();

        let message = if let Some(exit) = reporter.exit_error().await {
            Some(format!("Dispatcher stopped: {exit}"))
        } else if reporter.is_connection_healthy().await {
            None
        } else {
            Some("Dispatcher connection is down".to_string())
        };

        let response_time_ms = self.elapsed_ms(start);
        match message {
            None => ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms },
            Some(message) => {
                error!("Dispatcher health check failed: {}", message);
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(message),
                    response_time_ms,
                }
            },
        }
    }

    fn elapsed_ms(&self, start: std::time::Instant) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(start);
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Health check endpoint handler.
///
/// Answers 200 when every component is up and 503 otherwise.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let health_service = HealthService::new(app_state.clock.clone());
    let response =
        health_service.health_check(app_state.feeds.as_ref(), app_state.dispatcher.as_ref()).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        db_status = ?response.checks.database.status,
        "Health check completed"
    );

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint.
///
/// Reports only that the HTTP server is responding.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    debug!("Performing liveness check");

    let response = serde_json::json!({
        "status": "alive",
        "timestamp": DateTime::<Utc>::from(app_state.clock.now_system()),
        "service": "eventpub"
    });

    (StatusCode::OK, Json(response)).into_response()
}
