//! Eventpub service.
//!
//! Connects to the event store, ensures its tables exist, and serves the
//! Atom feed and health endpoints until a shutdown signal arrives.
//! Dispatchers are embedded by applications through `eventpub-dispatch`.

use std::sync::Arc;

use anyhow::{Context, Result};
use eventpub_api::{AppState, Config, PostgresFeedStore};
use eventpub_core::{storage::Storage, RealClock};
use eventpub_dispatch::connect_pool;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_level)?;

    info!("Starting eventpub");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let clock = Arc::new(RealClock::new());

    let pool = connect_pool(
        &config.database_url,
        config.to_pool_options(),
        config.database_connect_attempts,
        config.connect_retry_delay(),
        clock.as_ref(),
    )
    .await
    .context("Failed to connect to the event store")?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.ensure_schema().await.context("Failed to ensure event store schema")?;

    let pending = storage.publish_queue.pending_count().await?;
    info!(pending, "Event store schema ready");

    let state = AppState::new(
        Arc::new(PostgresFeedStore::new(storage)),
        clock,
        config.to_feed_settings(),
    );

    let addr = config.parse_server_addr()?;
    eventpub_api::start_server(state, addr, config.request_timeout())
        .await
        .context("HTTP server failed")?;

    pool.close().await;
    info!("Eventpub shutdown complete");
    Ok(())
}

/// Installs the fmt subscriber, filtered by `RUST_LOG` or the configured
/// level.
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{level},tower_http=debug")))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}
