//! Repository for the read-side feed tables.
//!
//! Feed pages form a backward-linked list in `feeds`; `feed_state` names
//! the page currently being filled and `feed_data` holds the entries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{error::Result, models::FeedPage};

/// Repository for feed page lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Identifier of the page currently being filled, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn current_feed_id(&self) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT feed_id FROM feed_state LIMIT 1")
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(|(feed_id,)| feed_id))
    }

    /// Finds a page by identifier.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, feed_id: &str) -> Result<Option<FeedPage>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT feed_id, previous FROM feeds WHERE feed_id = $1")
                .bind(feed_id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(row.map(|(feed_id, previous)| FeedPage { feed_id, previous }))
    }

    /// Finds the page that follows `feed_id`, i.e. names it as previous.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_next(&self, feed_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT feed_id FROM feeds WHERE previous = $1 LIMIT 1")
                .bind(feed_id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(row.map(|(feed_id,)| feed_id))
    }

    /// Timestamp of the newest entry on a page.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn last_updated(&self, feed_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT event_time FROM feed_data
            WHERE feed_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(feed_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|(event_time,)| event_time))
    }
}
