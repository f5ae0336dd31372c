//! Repository for the append-only event log.
//!
//! Log rows are never mutated after insert, so point lookups run on the
//! pool directly instead of joining the dispatcher's polling transaction.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EventRecord, PendingEventRef},
};

/// Repository for event log reads.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Looks up the event body addressed by a queue reference.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. A missing row is `Ok(None)`.
    pub async fn find(&self, key: &PendingEventRef) -> Result<Option<EventRecord>> {
        let row: Option<(String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT type_code, payload FROM events
            WHERE aggregate_id = $1 AND version = $2
            "#,
        )
        .bind(&key.aggregate_id)
        .bind(key.version)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|(type_code, payload)| EventRecord {
            aggregate_id: key.aggregate_id.clone(),
            version: key.version,
            type_code,
            payload: payload.into(),
        }))
    }
}
