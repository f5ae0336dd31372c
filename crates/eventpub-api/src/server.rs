//! HTTP server setup and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! The server stops accepting connections on CTRL+C or SIGTERM and drains
//! in-flight requests before returning.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use eventpub_core::Clock;
use eventpub_dispatch::HealthReporter;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{feed_store::FeedStore, handlers};

/// Where feed links point and what the documents are called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    base_url: String,
    title: String,
}

impl FeedSettings {
    /// Creates settings for feeds served under `base_url`.
    ///
    /// A trailing slash on the base URL is ignored.
    pub fn new(base_url: impl Into<String>, title: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, title: title.into() }
    }

    /// Absolute URL of a path segment under the base URL.
    pub fn href(&self, segment: &str) -> String {
        format!("{}/{}", self.base_url, segment)
    }

    /// Title written into every feed document.
    pub fn title(&self) -> &str {
        &self.title
    }
}

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Feed page lookups.
    pub feeds: Arc<dyn FeedStore>,
    /// Clock for `updated` timestamps and health timings.
    pub clock: Arc<dyn Clock>,
    /// Link and title settings.
    pub feed: FeedSettings,
    /// Health view of an in-process dispatcher, when one runs.
    pub dispatcher: Option<HealthReporter>,
}

impl AppState {
    /// Creates state without a dispatcher.
    pub fn new(feeds: Arc<dyn FeedStore>, clock: Arc<dyn Clock>, feed: FeedSettings) -> Self {
        Self { feeds, clock, feed, dispatcher: None }
    }

    /// Attaches a dispatcher whose health the health endpoint reports.
    #[must_use]
    pub fn with_dispatcher(mut self, reporter: HealthReporter) -> Self {
        self.dispatcher = Some(reporter);
        self
    }
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check));

    let feed_routes = Router::new()
        .route("/notifications/recent", get(handlers::recent_feed))
        .route("/notifications/{feed_id}", get(handlers::feed_page));

    Router::new()
        .merge(health_routes)
        .merge(feed_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an X-Request-Id header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves requests on `addr` until a shutdown signal arrives.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received CTRL+C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }

    warn!("Draining in-flight requests");
}
