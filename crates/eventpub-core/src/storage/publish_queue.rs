//! Repository for the publish queue table.
//!
//! Polling happens inside a caller-owned transaction: the row locks taken
//! by [`Repository::poll_locked`] live exactly as long as that transaction,
//! which is what makes competing dispatchers safe without any in-process
//! coordination.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{error::Result, models::PendingEventRef};

/// How a poll treats rows already locked by another transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// `FOR UPDATE`: block until the competing transaction ends.
    #[default]
    Wait,
    /// `FOR UPDATE SKIP LOCKED`: take the next unlocked rows instead.
    SkipLocked,
}

impl LockMode {
    const fn poll_query(self) -> &'static str {
        match self {
            Self::Wait => {
                r#"
                SELECT aggregate_id, version FROM event_publish
                ORDER BY version ASC
                LIMIT $1
                FOR UPDATE
                "#
            },
            Self::SkipLocked => {
                r#"
                SELECT aggregate_id, version FROM event_publish
                ORDER BY version ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                "#
            },
        }
    }
}

/// Repository for publish queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Locks up to `limit` pending rows, lowest version first.
    ///
    /// Ordering is by version across all aggregates, so one aggregate's rows
    /// always come back in non-decreasing version order while different
    /// aggregates interleave freely.
    ///
    /// # Errors
    ///
    /// Returns error if the locking query fails.
    pub async fn poll_locked(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        limit: usize,
        lock_mode: LockMode,
    ) -> Result<Vec<PendingEventRef>> {
        let rows: Vec<(String, i32)> = sqlx::query_as(lock_mode.poll_query())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut **tx)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(aggregate_id, version)| PendingEventRef { aggregate_id, version })
            .collect())
    }

    /// Deletes a queue row within the polling transaction.
    ///
    /// Deleting a row that is already gone affects nothing and succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if the delete statement fails.
    pub async fn delete(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &PendingEventRef,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM event_publish WHERE aggregate_id = $1 AND version = $2")
                .bind(&key.aggregate_id)
                .bind(key.version)
                .execute(&mut **tx)
                .await?;

        Ok(result.rows_affected())
    }

    /// Number of rows still waiting in the queue.
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails.
    pub async fn pending_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM event_publish")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
