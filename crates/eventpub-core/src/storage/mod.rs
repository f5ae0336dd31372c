//! Postgres repositories over the event store tables.
//!
//! The publish queue is the only table this system mutates; the event log
//! and the feed tables are read-only from here. Row inserts into all of
//! them belong to the write path.

use std::sync::Arc;

use sqlx::PgPool;

pub mod event_log;
pub mod feeds;
pub mod publish_queue;

pub use publish_queue::LockMode;

use crate::error::Result;

/// Schema statements applied by [`Storage::ensure_schema`], in order.
const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS events (
        aggregate_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        type_code TEXT NOT NULL,
        payload BYTEA NOT NULL,
        PRIMARY KEY (aggregate_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_publish (
        aggregate_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        PRIMARY KEY (aggregate_id, version)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_event_publish_version
    ON event_publish(version)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feeds (
        feed_id TEXT PRIMARY KEY,
        previous TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_state (
        feed_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_data (
        id BIGSERIAL PRIMARY KEY,
        feed_id TEXT NOT NULL,
        event_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        aggregate_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        type_code TEXT NOT NULL,
        payload BYTEA NOT NULL
    )
    "#,
];

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the publish queue.
    pub publish_queue: Arc<publish_queue::Repository>,

    /// Repository for the append-only event log.
    pub event_log: Arc<event_log::Repository>,

    /// Repository for the read-side feed pages.
    pub feeds: Arc<feeds::Repository>,

    pool: PgPool,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let shared = Arc::new(pool.clone());

        Self {
            publish_queue: Arc::new(publish_queue::Repository::new(shared.clone())),
            event_log: Arc::new(event_log::Repository::new(shared.clone())),
            feeds: Arc::new(feeds::Repository::new(shared)),
            pool,
        }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verifies the database answers a no-op round trip.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Connection` when the server is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Creates the event store tables when they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}
