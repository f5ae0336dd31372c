//! Connection and resilience layer.
//!
//! A [`Connection`] owns the storage handle one dispatcher works through.
//! Every handle it hands out has answered a `SELECT 1` round trip, both on
//! the first connect and on every reconnect; a replacement that fails that
//! check never displaces the current handle.

use std::{sync::Arc, time::Duration};

use eventpub_core::{Clock, CoreError};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{DispatchError, Result},
    storage::{Connector, PgConnector, PublishStorage},
};

/// Default pause between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Returns whether reconnecting could cure `error`.
pub fn is_connection_error(error: &DispatchError) -> bool {
    error.is_connection_error()
}

/// Live storage handle with bounded reconnect.
pub struct Connection {
    current: RwLock<Arc<dyn PublishStorage>>,
    connector: Arc<dyn Connector>,
    retry_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// Opens and verifies a storage handle, retrying up to `max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns `Connect` carrying the last failure when every attempt fails.
    pub async fn establish(
        connector: Arc<dyn Connector>,
        max_attempts: u32,
        retry_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage = open_verified(connector.as_ref(), max_attempts, retry_delay, &*clock).await?;

        Ok(Self { current: RwLock::new(storage), connector, retry_delay, clock })
    }

    /// Connects to Postgres at `url` with the given pool options.
    ///
    /// # Errors
    ///
    /// Returns `Connect` when no attempt yields a responsive server.
    pub async fn connect(
        url: &str,
        max_attempts: u32,
        options: PgPoolOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let connector: Arc<dyn Connector> = Arc::new(PgConnector::new(url, options));
        Self::establish(connector, max_attempts, DEFAULT_RETRY_DELAY, clock).await
    }

    /// Current storage handle.
    pub async fn storage(&self) -> Arc<dyn PublishStorage> {
        self.current.read().await.clone()
    }

    /// Database handle for processor callbacks.
    pub async fn db_handle(&self) -> Option<PgPool> {
        self.current.read().await.db_handle()
    }

    /// Replaces the held handle with a freshly opened and verified one.
    ///
    /// On failure the existing handle stays in place.
    ///
    /// # Errors
    ///
    /// Returns `Connect` when every attempt fails.
    pub async fn reconnect(&self, max_attempts: u32) -> Result<()> {
        let storage =
            open_verified(self.connector.as_ref(), max_attempts, self.retry_delay, &*self.clock)
                .await?;
        *self.current.write().await = storage;

        info!("reconnected to database");
        Ok(())
    }

    /// Liveness check against the current handle.
    pub async fn ping(&self) -> bool {
        let storage = self.storage().await;
        match storage.ping().await {
            Ok(()) => true,
            Err(e) => {
                info!(error = %e, "database ping failed");
                false
            },
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("retry_delay", &self.retry_delay).finish_non_exhaustive()
    }
}

/// Opens a Postgres pool and verifies it, with the same retry policy.
///
/// Used by the API binary, which needs a bare pool rather than a
/// dispatcher connection.
///
/// # Errors
///
/// Returns `Connect` when every attempt fails.
pub async fn connect_pool(
    url: &str,
    options: PgPoolOptions,
    max_attempts: u32,
    retry_delay: Duration,
    clock: &dyn Clock,
) -> Result<PgPool> {
    let connector = PgConnector::new(url, options);
    let storage = open_verified(&connector, max_attempts, retry_delay, clock).await?;

    storage
        .db_handle()
        .ok_or_else(|| DispatchError::connection("connector opened a storage without a pool"))
}

async fn open_verified(
    connector: &dyn Connector,
    max_attempts: u32,
    retry_delay: Duration,
    clock: &dyn Clock,
) -> Result<Arc<dyn PublishStorage>> {
    let mut last_error = None;

    for attempt in 1..=max_attempts.max(1) {
        let outcome = async {
            let storage = connector.open().await?;
            storage.ping().await?;
            Ok::<_, CoreError>(storage)
        }
        .await;

        match outcome {
            Ok(storage) => {
                debug!(attempt, "database connection verified");
                return Ok(storage);
            },
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "database connection attempt failed");
                last_error = Some(e);
            },
        }

        if attempt < max_attempts {
            clock.sleep(retry_delay).await;
        }
    }

    Err(connect_error(max_attempts, last_error))
}

fn connect_error(max_attempts: u32, last_error: Option<CoreError>) -> DispatchError {
    DispatchError::Connect {
        attempts: max_attempts.max(1),
        message: last_error.map_or_else(|| "no connection attempt made".to_string(), |e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use eventpub_core::TestClock;

    use super::*;
    use crate::storage::mock::{MockConnector, MockPublishStorage, Operation};

    async fn establish(connector: &MockConnector, attempts: u32) -> Result<Connection> {
        Connection::establish(
            Arc::new(connector.clone()),
            attempts,
            Duration::from_millis(100),
            Arc::new(TestClock::new()),
        )
        .await
    }

    #[tokio::test]
    async fn establish_verifies_with_ping() {
        let storage = MockPublishStorage::new();
        let connector = MockConnector::new(storage.clone());

        let connection = establish(&connector, 3).await.unwrap();

        assert!(connection.ping().await);
        assert_eq!(storage.calls(Operation::Ping), 2);
        assert!(connection.db_handle().await.is_none());
    }

    #[tokio::test]
    async fn establish_retries_then_succeeds() {
        let connector = MockConnector::new(MockPublishStorage::new());
        connector.fail_opens(2);

        let clock = TestClock::new();
        let connection = Connection::establish(
            Arc::new(connector.clone()),
            3,
            Duration::from_secs(2),
            Arc::new(clock.clone()),
        )
        .await;

        assert!(connection.is_ok());
        assert_eq!(connector.open_count(), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn establish_gives_up_after_max_attempts() {
        let storage = MockPublishStorage::new();
        storage.set_ping_healthy(false);
        let connector = MockConnector::new(storage);

        let err = establish(&connector, 4).await.unwrap_err();

        match err {
            DispatchError::Connect { attempts, message } => {
                assert_eq!(attempts, 4);
                assert!(message.contains("unreachable"));
            },
            other => panic!("expected Connect, got {other:?}"),
        }
        assert_eq!(connector.open_count(), 4);
    }

    #[tokio::test]
    async fn connect_pool_uses_the_shared_retry_policy() {
        let clock = TestClock::new();
        let options = PgPoolOptions::new().acquire_timeout(Duration::from_millis(200));

        let url = "postgresql://127.0.0.1:1/events";
        let err = connect_pool(url, options, 2, Duration::from_secs(3), &clock).await.unwrap_err();

        assert!(matches!(err, DispatchError::Connect { attempts: 2, .. }));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failed_reconnect_keeps_current_handle() {
        let storage = MockPublishStorage::new();
        let connector = MockConnector::new(storage.clone());
        let connection = establish(&connector, 1).await.unwrap();

        connector.fail_opens(5);
        let err = connection.reconnect(5).await.unwrap_err();

        assert!(is_connection_error(&err));
        assert!(connection.ping().await);
    }

    #[tokio::test]
    async fn reconnect_swaps_in_verified_handle() {
        let connector = MockConnector::new(MockPublishStorage::new());
        let connection = establish(&connector, 1).await.unwrap();

        connector.fail_opens(1);
        connection.reconnect(2).await.unwrap();

        assert_eq!(connector.open_count(), 3);
    }

    #[tokio::test]
    async fn ping_reports_unhealthy_storage() {
        let storage = MockPublishStorage::new();
        let connector = MockConnector::new(storage.clone());
        let connection = establish(&connector, 1).await.unwrap();

        storage.set_ping_healthy(false);

        assert!(!connection.ping().await);
    }
}
