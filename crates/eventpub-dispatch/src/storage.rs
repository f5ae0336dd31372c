//! Storage abstraction layer for the dispatcher.
//!
//! The engine talks to the publish queue and the event log only through
//! [`PublishStorage`] and [`PublishTransaction`], so the poll loop can be
//! exercised against the in-memory [`mock`] without a database. Production
//! uses [`PostgresPublishStorage`] over `eventpub_core::storage::Storage`.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use eventpub_core::{
    error::Result,
    models::{EventRecord, PendingEventRef},
    storage::{publish_queue, LockMode, Storage},
};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use tracing::warn;

/// Read access to the event log and transactional access to the queue.
pub trait PublishStorage: Send + Sync + 'static {
    /// Opens a transaction that owns the row locks of one pass.
    fn begin(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn PublishTransaction>>> + Send + '_>>;

    /// Looks up an event body outside any transaction.
    ///
    /// A missing log row is `Ok(None)`; the engine turns it into
    /// `EventNotFound`.
    fn find_event(
        &self,
        key: PendingEventRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventRecord>>> + Send + '_>>;

    /// No-op round trip used to verify liveness.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Database handle passed to processor callbacks.
    ///
    /// `None` for storages that are not backed by Postgres.
    fn db_handle(&self) -> Option<PgPool>;
}

/// One open transaction over the publish queue.
///
/// Locks taken by [`poll_pending`](Self::poll_pending) are released when
/// the transaction commits, rolls back, or is dropped.
pub trait PublishTransaction: Send {
    /// Locks up to `limit` pending rows, lowest version first.
    fn poll_pending(
        &mut self,
        limit: usize,
        lock_mode: LockMode,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEventRef>>> + Send + '_>>;

    /// Deletes a queue row inside this transaction.
    ///
    /// Returns the number of rows removed; zero for an already deleted row.
    fn delete_pending(
        &mut self,
        key: PendingEventRef,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Persists the deletions made in this transaction.
    fn commit(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    /// Discards the deletions made in this transaction.
    fn rollback(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Opens fresh storage handles for the connection layer.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new storage handle. Liveness is verified by the caller.
    fn open(&self) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PublishStorage>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresPublishStorage {
    storage: Arc<Storage>,
}

impl PostgresPublishStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl PublishStorage for PostgresPublishStorage {
    fn begin(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn PublishTransaction>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let tx = storage.pool().begin().await?;
            let transaction: Box<dyn PublishTransaction> = Box::new(PostgresPublishTransaction {
                tx,
                queue: storage.publish_queue.clone(),
            });
            Ok(transaction)
        })
    }

    fn find_event(
        &self,
        key: PendingEventRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.event_log.find(&key).await })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }

    fn db_handle(&self) -> Option<PgPool> {
        Some(self.storage.pool().clone())
    }
}

struct PostgresPublishTransaction {
    tx: Transaction<'static, Postgres>,
    queue: Arc<publish_queue::Repository>,
}

impl PublishTransaction for PostgresPublishTransaction {
    fn poll_pending(
        &mut self,
        limit: usize,
        lock_mode: LockMode,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEventRef>>> + Send + '_>> {
        Box::pin(async move { self.queue.poll_locked(&mut self.tx, limit, lock_mode).await })
    }

    fn delete_pending(
        &mut self,
        key: PendingEventRef,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move { self.queue.delete(&mut self.tx, &key).await })
    }

    fn commit(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            self.tx.commit().await?;
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            self.tx.rollback().await?;
            Ok(())
        })
    }
}

/// Smallest pool a dispatcher can make progress with.
pub const MIN_POOL_CONNECTIONS: u32 = 2;

/// Opens Postgres pools from a connection string.
#[derive(Clone)]
pub struct PgConnector {
    url: String,
    options: PgPoolOptions,
}

impl PgConnector {
    /// Creates a connector with the given pool options.
    ///
    /// A pass holds one pooled connection for its transaction while event
    /// lookups and processors draw on the rest, so pools smaller than
    /// [`MIN_POOL_CONNECTIONS`] are raised to it.
    pub fn new(url: impl Into<String>, options: PgPoolOptions) -> Self {
        let requested = options.get_max_connections();
        let options = if requested < MIN_POOL_CONNECTIONS {
            warn!(
                requested,
                minimum = MIN_POOL_CONNECTIONS,
                "raising dispatcher pool size to the minimum"
            );
            options.max_connections(MIN_POOL_CONNECTIONS)
        } else {
            options
        };
        Self { url: url.into(), options }
    }

    /// Largest number of connections the opened pools may hold.
    pub fn max_connections(&self) -> u32 {
        self.options.get_max_connections()
    }

    /// Creates a connector with a small pool suited to one dispatcher.
    pub fn with_defaults(url: impl Into<String>) -> Self {
        Self::new(
            url,
            PgPoolOptions::new().max_connections(2).acquire_timeout(Duration::from_secs(5)),
        )
    }

    /// Opens a pool without wrapping it in a storage adapter.
    ///
    /// # Errors
    ///
    /// Returns error if the server refuses the initial connection.
    pub async fn open_pool(&self) -> Result<PgPool> {
        Ok(self.options.clone().connect(&self.url).await?)
    }
}

impl std::fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnector").field("url", &"<redacted>").finish_non_exhaustive()
    }
}

impl Connector for PgConnector {
    fn open(&self) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PublishStorage>>> + Send + '_>> {
        Box::pin(async move {
            let pool = self.open_pool().await?;
            let storage: Arc<dyn PublishStorage> =
                Arc::new(PostgresPublishStorage::new(Arc::new(Storage::new(pool))));
            Ok(storage)
        })
    }
}

pub mod mock {
    //! In-memory storage for exercising the dispatcher without a database.
    //!
    //! Row locks are tracked per transaction the way Postgres tracks them:
    //! a [`LockMode::Wait`] poll waits for competing transactions to finish
    //! while a [`LockMode::SkipLocked`] poll passes over their rows. Every
    //! operation can be scripted to fail a number of times, and every call
    //! is counted.

    use std::{
        collections::{HashMap, HashSet, VecDeque},
        future::Future,
        pin::Pin,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    };

    use eventpub_core::{
        error::{CoreError, Result},
        models::{EventRecord, PendingEventRef},
        storage::LockMode,
    };
    use sqlx::PgPool;
    use tokio::sync::Notify;

    use super::{Connector, PublishStorage, PublishTransaction};

    /// Storage operation that can be scripted to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Operation {
        /// Opening a transaction.
        Begin,
        /// Locking pending rows.
        Poll,
        /// Reading an event body.
        FindEvent,
        /// Deleting a queue row.
        Delete,
        /// Committing a transaction.
        Commit,
        /// Rolling back a transaction.
        Rollback,
        /// Liveness round trip.
        Ping,
    }

    /// Class of a scripted failure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Failure {
        /// Fails as a broken connection.
        Connection,
        /// Fails as a logical query error.
        Query,
    }

    impl Failure {
        fn into_error(self, operation: Operation) -> CoreError {
            match self {
                Self::Connection => {
                    CoreError::Connection(format!("injected connection failure in {operation:?}"))
                },
                Self::Query => CoreError::Database(format!("injected query failure in {operation:?}")),
            }
        }
    }

    #[derive(Default)]
    struct MockState {
        queue: Vec<PendingEventRef>,
        log: HashMap<PendingEventRef, EventRecord>,
        locked: HashSet<PendingEventRef>,
        failures: HashMap<Operation, VecDeque<Failure>>,
        calls: HashMap<Operation, u64>,
        polls: Vec<Vec<PendingEventRef>>,
        ping_unhealthy: bool,
    }

    impl MockState {
        fn record(&mut self, operation: Operation) -> Result<()> {
            *self.calls.entry(operation).or_insert(0) += 1;

            if operation == Operation::Ping && self.ping_unhealthy {
                return Err(CoreError::Connection("database unreachable".into()));
            }

            match self.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
                Some(failure) => Err(failure.into_error(operation)),
                None => Ok(()),
            }
        }

        /// Queue rows in poll order: version ascending, then aggregate.
        fn ordered_queue(&self) -> Vec<PendingEventRef> {
            let mut rows = self.queue.clone();
            rows.sort_by(|a, b| {
                a.version.cmp(&b.version).then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
            });
            rows
        }

        fn release(&mut self, keys: &[PendingEventRef]) {
            for key in keys {
                self.locked.remove(key);
            }
        }
    }

    struct Shared {
        state: Mutex<MockState>,
        released: Notify,
    }

    impl Shared {
        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// In-memory publish queue and event log.
    ///
    /// Clones share the same state, so a test can keep one handle for
    /// seeding and inspection while the dispatcher owns another.
    #[derive(Clone)]
    pub struct MockPublishStorage {
        shared: Arc<Shared>,
    }

    impl MockPublishStorage {
        /// Creates an empty storage.
        pub fn new() -> Self {
            Self {
                shared: Arc::new(Shared {
                    state: Mutex::new(MockState::default()),
                    released: Notify::new(),
                }),
            }
        }

        /// Appends an event to the log and queues it for dispatch.
        pub fn append(&self, event: EventRecord) {
            let key = event.key();
            let mut state = self.shared.state();
            state.log.insert(key.clone(), event);
            if !state.queue.contains(&key) {
                state.queue.push(key);
            }
        }

        /// Queues a reference without a matching log row.
        pub fn enqueue_dangling(&self, key: PendingEventRef) {
            let mut state = self.shared.state();
            if !state.queue.contains(&key) {
                state.queue.push(key);
            }
        }

        /// Rows still waiting in the queue, in poll order.
        pub fn pending(&self) -> Vec<PendingEventRef> {
            self.shared.state().ordered_queue()
        }

        /// Number of rows currently locked by open transactions.
        pub fn locked_count(&self) -> usize {
            self.shared.state().locked.len()
        }

        /// Rows returned by every successful poll so far, in order.
        pub fn poll_history(&self) -> Vec<Vec<PendingEventRef>> {
            self.shared.state().polls.clone()
        }

        /// Scripts the next `times` calls of `operation` to fail.
        pub fn fail_next(&self, operation: Operation, failure: Failure, times: usize) {
            let mut state = self.shared.state();
            let script = state.failures.entry(operation).or_default();
            script.extend(std::iter::repeat(failure).take(times));
        }

        /// Makes every ping fail until called again with `true`.
        pub fn set_ping_healthy(&self, healthy: bool) {
            self.shared.state().ping_unhealthy = !healthy;
        }

        /// Number of times `operation` has been called.
        pub fn calls(&self, operation: Operation) -> u64 {
            self.shared.state().calls.get(&operation).copied().unwrap_or(0)
        }
    }

    impl Default for MockPublishStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PublishStorage for MockPublishStorage {
        fn begin(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Box<dyn PublishTransaction>>> + Send + '_>>
        {
            let shared = self.shared.clone();
            Box::pin(async move {
                shared.state().record(Operation::Begin)?;
                let transaction: Box<dyn PublishTransaction> = Box::new(MockTransaction {
                    shared,
                    locked: Vec::new(),
                    deletions: Vec::new(),
                });
                Ok(transaction)
            })
        }

        fn find_event(
            &self,
            key: PendingEventRef,
        ) -> Pin<Box<dyn Future<Output = Result<Option<EventRecord>>> + Send + '_>> {
            let shared = self.shared.clone();
            Box::pin(async move {
                let mut state = shared.state();
                state.record(Operation::FindEvent)?;
                Ok(state.log.get(&key).cloned())
            })
        }

        fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let shared = self.shared.clone();
            Box::pin(async move { shared.state().record(Operation::Ping) })
        }

        fn db_handle(&self) -> Option<PgPool> {
            None
        }
    }

    struct MockTransaction {
        shared: Arc<Shared>,
        locked: Vec<PendingEventRef>,
        deletions: Vec<PendingEventRef>,
    }

    impl MockTransaction {
        fn finish(&mut self, apply: bool) {
            {
                let mut state = self.shared.state();
                if apply {
                    let deletions = std::mem::take(&mut self.deletions);
                    state.queue.retain(|row| !deletions.contains(row));
                }
                let locked = std::mem::take(&mut self.locked);
                state.release(&locked);
            }
            self.shared.released.notify_waiters();
        }
    }

    impl PublishTransaction for MockTransaction {
        fn poll_pending(
            &mut self,
            limit: usize,
            lock_mode: LockMode,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEventRef>>> + Send + '_>> {
            Box::pin(async move {
                self.shared.state().record(Operation::Poll)?;

                loop {
                    let released = self.shared.released.notified();
                    tokio::pin!(released);
                    released.as_mut().enable();

                    {
                        let mut state = self.shared.state();
                        let own: HashSet<&PendingEventRef> = self.locked.iter().collect();
                        let candidates = state.ordered_queue();
                        let foreign =
                            |row: &PendingEventRef| state.locked.contains(row) && !own.contains(row);

                        let batch: Option<Vec<PendingEventRef>> = match lock_mode {
                            LockMode::SkipLocked => Some(
                                candidates.into_iter().filter(|row| !foreign(row)).take(limit).collect(),
                            ),
                            LockMode::Wait => {
                                let batch: Vec<PendingEventRef> =
                                    candidates.into_iter().take(limit).collect();
                                if batch.iter().any(|row| foreign(row)) {
                                    None
                                } else {
                                    Some(batch)
                                }
                            },
                        };

                        if let Some(batch) = batch {
                            for row in &batch {
                                state.locked.insert(row.clone());
                            }
                            state.polls.push(batch.clone());
                            drop(state);
                            for row in &batch {
                                if !self.locked.contains(row) {
                                    self.locked.push(row.clone());
                                }
                            }
                            return Ok(batch);
                        }
                    }

                    released.await;
                }
            })
        }

        fn delete_pending(
            &mut self,
            key: PendingEventRef,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.shared.state();
                state.record(Operation::Delete)?;

                if self.deletions.contains(&key) || !state.queue.contains(&key) {
                    return Ok(0);
                }
                drop(state);

                self.deletions.push(key);
                Ok(1)
            })
        }

        fn commit(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
            Box::pin(async move {
                let outcome = self.shared.state().record(Operation::Commit);
                self.finish(outcome.is_ok());
                outcome
            })
        }

        fn rollback(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
            Box::pin(async move {
                let outcome = self.shared.state().record(Operation::Rollback);
                self.finish(false);
                outcome
            })
        }
    }

    impl Drop for MockTransaction {
        fn drop(&mut self) {
            if !self.locked.is_empty() {
                self.finish(false);
            }
        }
    }

    /// Connector handing out one shared [`MockPublishStorage`].
    #[derive(Clone)]
    pub struct MockConnector {
        storage: MockPublishStorage,
        open_failures: Arc<Mutex<VecDeque<Failure>>>,
        opens: Arc<Mutex<u64>>,
    }

    impl MockConnector {
        /// Creates a connector that always opens `storage`.
        pub fn new(storage: MockPublishStorage) -> Self {
            Self {
                storage,
                open_failures: Arc::new(Mutex::new(VecDeque::new())),
                opens: Arc::new(Mutex::new(0)),
            }
        }

        /// Scripts the next `times` opens to fail with a connection error.
        pub fn fail_opens(&self, times: usize) {
            let mut failures = self.open_failures.lock().unwrap_or_else(PoisonError::into_inner);
            failures.extend(std::iter::repeat(Failure::Connection).take(times));
        }

        /// Number of open attempts so far.
        pub fn open_count(&self) -> u64 {
            *self.opens.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Connector for MockConnector {
        fn open(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PublishStorage>>> + Send + '_>> {
            Box::pin(async move {
                *self.opens.lock().unwrap_or_else(PoisonError::into_inner) += 1;

                let failure =
                    self.open_failures.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                if let Some(failure) = failure {
                    return Err(CoreError::Connection(format!("{failure:?} failure while opening")));
                }

                let storage: Arc<dyn PublishStorage> = Arc::new(self.storage.clone());
                Ok(storage)
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use std::time::Duration;

        use super::*;

        fn seeded(rows: &[(&str, i32)]) -> MockPublishStorage {
            let storage = MockPublishStorage::new();
            for (aggregate, version) in rows {
                storage.append(EventRecord::new(*aggregate, *version, "Created", b"{}".to_vec()));
            }
            storage
        }

        #[tokio::test]
        async fn poll_orders_by_version_across_aggregates() {
            let storage = seeded(&[("b", 2), ("a", 3), ("b", 1), ("a", 1)]);

            let mut tx = storage.begin().await.unwrap();
            let rows = tx.poll_pending(10, LockMode::Wait).await.unwrap();

            assert_eq!(
                rows,
                vec![
                    PendingEventRef::new("a", 1),
                    PendingEventRef::new("b", 1),
                    PendingEventRef::new("b", 2),
                    PendingEventRef::new("a", 3),
                ]
            );
        }

        #[tokio::test]
        async fn rollback_keeps_rows_and_releases_locks() {
            let storage = seeded(&[("a", 1)]);

            let mut tx = storage.begin().await.unwrap();
            let rows = tx.poll_pending(10, LockMode::Wait).await.unwrap();
            assert_eq!(tx.delete_pending(rows[0].clone()).await.unwrap(), 1);
            assert_eq!(storage.locked_count(), 1);

            tx.rollback().await.unwrap();

            assert_eq!(storage.pending(), vec![PendingEventRef::new("a", 1)]);
            assert_eq!(storage.locked_count(), 0);
        }

        #[tokio::test]
        async fn deleting_twice_in_one_transaction_is_a_no_op() {
            let storage = seeded(&[("a", 1)]);
            let key = PendingEventRef::new("a", 1);

            let mut tx = storage.begin().await.unwrap();
            tx.poll_pending(10, LockMode::Wait).await.unwrap();
            assert_eq!(tx.delete_pending(key.clone()).await.unwrap(), 1);
            assert_eq!(tx.delete_pending(key).await.unwrap(), 0);
            tx.commit().await.unwrap();

            assert!(storage.pending().is_empty());
        }

        #[tokio::test]
        async fn skip_locked_poll_passes_over_held_rows() {
            let storage = seeded(&[("a", 1), ("a", 2), ("a", 3)]);

            let mut first = storage.begin().await.unwrap();
            let held = first.poll_pending(2, LockMode::SkipLocked).await.unwrap();

            let mut second = storage.begin().await.unwrap();
            let rest = second.poll_pending(2, LockMode::SkipLocked).await.unwrap();

            assert_eq!(held.len(), 2);
            assert_eq!(rest, vec![PendingEventRef::new("a", 3)]);
        }

        #[tokio::test]
        async fn wait_poll_blocks_until_holder_commits() {
            let storage = seeded(&[("a", 1), ("a", 2)]);

            let mut first = storage.begin().await.unwrap();
            let held = first.poll_pending(1, LockMode::Wait).await.unwrap();
            first.delete_pending(held[0].clone()).await.unwrap();

            let waiter = {
                let storage = storage.clone();
                tokio::spawn(async move {
                    let mut second = storage.begin().await.unwrap();
                    second.poll_pending(1, LockMode::Wait).await.unwrap()
                })
            };

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!waiter.is_finished());

            first.commit().await.unwrap();

            let rows = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert_eq!(rows, vec![PendingEventRef::new("a", 2)]);
        }

        #[tokio::test]
        async fn scripted_failures_are_consumed_in_order() {
            let storage = MockPublishStorage::new();
            storage.fail_next(Operation::Begin, Failure::Query, 1);
            storage.fail_next(Operation::Begin, Failure::Connection, 1);

            let first = storage.begin().await.err().unwrap();
            let second = storage.begin().await.err().unwrap();

            assert!(!first.is_connection_error());
            assert!(second.is_connection_error());
            assert!(storage.begin().await.is_ok());
            assert_eq!(storage.calls(Operation::Begin), 3);
        }

        #[tokio::test]
        async fn connector_failures_then_success() {
            let connector = MockConnector::new(MockPublishStorage::new());
            connector.fail_opens(1);

            assert!(connector.open().await.is_err());
            assert!(connector.open().await.is_ok());
            assert_eq!(connector.open_count(), 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_connection_pool_is_raised_to_minimum() {
        let connector = PgConnector::new(
            "postgresql://localhost/events",
            PgPoolOptions::new().max_connections(1),
        );

        assert_eq!(connector.max_connections(), MIN_POOL_CONNECTIONS);
    }

    #[test]
    fn larger_pool_is_kept() {
        let connector = PgConnector::new(
            "postgresql://localhost/events",
            PgPoolOptions::new().max_connections(8),
        );

        assert_eq!(connector.max_connections(), 8);
    }
}
