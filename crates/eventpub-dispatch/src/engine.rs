//! Poll-process-delete engine.
//!
//! One pass locks a batch of pending queue rows inside a transaction,
//! fetches each referenced event from the log, hands it to every
//! registered processor, and deletes the row as soon as any processor
//! succeeds. A pass that handled rows commits; an empty poll rolls back and
//! idles. A queued row with no log entry is skipped and left queued, and
//! the pass counts toward the consecutive-error budget. A failing pass rolls
//! back and backs off. It reconnects when the failure was connection-class
//! and the held handle no longer answers a ping; otherwise the failure is
//! counted. Exceeding the budget is the only way the loop ends by itself.
//!
//! Mutual exclusion between dispatcher instances comes entirely from the
//! row locks taken by the poll; nothing here coordinates in-process.

use std::{sync::Arc, time::Duration};

use eventpub_core::{models::PendingEventRef, storage::LockMode, Clock, EventRecord};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    connection::Connection,
    error::{DispatchError, Result},
    health::HealthReporter,
    registry::{EventProcessor, Registry},
    storage::{PublishStorage, PublishTransaction},
};

/// Upper bound on rows locked by a single poll.
pub const MAX_BATCH_SIZE: usize = 100;

/// Tuning for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Rows locked per poll, clamped to `1..=MAX_BATCH_SIZE`.
    pub batch_size: usize,

    /// Pause after a poll that found nothing.
    pub idle_delay: Duration,

    /// Pause after a failed pass.
    pub error_delay: Duration,

    /// Consecutive failed passes tolerated before the loop gives up.
    pub max_consecutive_errors: u32,

    /// Attempts per reconnect after a connection-class failure.
    pub reconnect_attempts: u32,

    /// Treatment of rows locked by a competing dispatcher.
    pub lock_mode: LockMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            idle_delay: Duration::from_secs(5),
            error_delay: Duration::from_secs(1),
            max_consecutive_errors: 100,
            reconnect_attempts: 5,
            lock_mode: LockMode::Wait,
        }
    }
}

impl DispatchConfig {
    /// Batch size actually used by a poll.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// How long [`Dispatcher::process_events`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run passes until the error budget is exhausted.
    Loop,
    /// Run exactly one pass, including its backoff, and return.
    SinglePass,
}

/// Counters describing dispatcher activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Passes started.
    pub passes: u64,
    /// Passes whose poll found no rows.
    pub idle_passes: u64,
    /// Passes that failed and rolled back.
    pub failed_passes: u64,
    /// Events handed to the processors in committed passes.
    pub events_dispatched: u64,
    /// Queued rows skipped because the log has no matching event.
    pub missing_events: u64,
    /// Queue rows removed by committed passes.
    pub rows_deleted: u64,
    /// Processor invocations that returned an error.
    pub handler_failures: u64,
    /// Current run of failed passes.
    pub consecutive_errors: u32,
    /// Successful reconnects after connection-class failures.
    pub reconnects: u64,
}

/// State shared between the engine and its health reporters.
pub(crate) struct SharedState {
    pub(crate) connection: RwLock<Option<Arc<Connection>>>,
    pub(crate) exit_error: RwLock<Option<DispatchError>>,
    pub(crate) stats: RwLock<DispatchStats>,
}

#[derive(Debug, Default)]
struct BatchSummary {
    rows: usize,
    dispatched: u64,
    rows_deleted: u64,
    handler_failures: u64,
    missing: u64,
    last_missing: Option<DispatchError>,
}

#[derive(Debug)]
enum PassOutcome {
    Idle,
    Dispatched(BatchSummary),
}

/// Event dispatcher over the publish queue.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use eventpub_core::RealClock;
/// use eventpub_dispatch::{DispatchConfig, Dispatcher, EventProcessor, Registry, RunMode};
/// use sqlx::postgres::PgPoolOptions;
///
/// # async fn example() -> Result<(), eventpub_dispatch::DispatchError> {
/// let mut registry = Registry::new();
/// registry.register(
///     "audit",
///     EventProcessor::new()
///         .on_initialize(|_db| async { Ok(()) })
///         .on_process(|_db, _event| async { Ok(()) }),
/// )?;
///
/// let dispatcher = Dispatcher::new(registry, DispatchConfig::default(), Arc::new(RealClock::new()));
/// dispatcher.connect("postgresql://localhost/events", 5, PgPoolOptions::new()).await?;
/// dispatcher.initialize_processors().await?;
/// dispatcher.process_events(RunMode::Loop).await
/// # }
/// ```
pub struct Dispatcher {
    registry: Registry,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<SharedState>,
}

impl Dispatcher {
    /// Creates a dispatcher with no connection.
    pub fn new(registry: Registry, config: DispatchConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            config,
            clock,
            shared: Arc::new(SharedState {
                connection: RwLock::new(None),
                exit_error: RwLock::new(None),
                stats: RwLock::new(DispatchStats::default()),
            }),
        }
    }

    /// Connects to Postgres and holds the verified connection.
    ///
    /// # Errors
    ///
    /// Returns `Connect` when no attempt yields a responsive server.
    pub async fn connect(
        &self,
        url: &str,
        max_attempts: u32,
        options: PgPoolOptions,
    ) -> Result<()> {
        let connection = Connection::connect(url, max_attempts, options, self.clock.clone()).await?;
        self.set_connection(connection).await;
        Ok(())
    }

    /// Holds an already established connection.
    pub async fn set_connection(&self, connection: Connection) {
        *self.shared.connection.write().await = Some(Arc::new(connection));
    }

    /// Registers a processor. See [`Registry::register`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistration` if either callback is missing.
    pub fn register(&mut self, name: impl Into<String>, processor: EventProcessor) -> Result<()> {
        self.registry.register(name, processor)
    }

    /// Mutable access to the registry between runs.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Registered processors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Loop tuning in effect.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Snapshot of the activity counters.
    pub async fn stats(&self) -> DispatchStats {
        self.shared.stats.read().await.clone()
    }

    /// Read-only view for health checks.
    pub fn health_reporter(&self) -> HealthReporter {
        HealthReporter::new(self.shared.clone())
    }

    /// Runs every processor's initialize callback, in registry order.
    ///
    /// # Errors
    ///
    /// Returns `Initialization` for the first callback that fails; later
    /// processors are not initialized.
    pub async fn initialize_processors(&self) -> Result<()> {
        let connection = self.shared.connection.read().await.clone();
        let db = match connection {
            Some(connection) => connection.db_handle().await,
            None => {
                warn!("initializing event processors without a database connection");
                None
            },
        };

        for registration in self.registry.iter() {
            registration.initialize(db.clone()).await.map_err(|e| {
                DispatchError::Initialization {
                    processor: registration.name().to_string(),
                    message: format!("{e:#}"),
                }
            })?;
            info!(processor = registration.name(), "event processor initialized");
        }

        Ok(())
    }

    /// Runs the dispatch loop.
    ///
    /// Fails immediately with `NoProcessorsRegistered` or `NotConnected`.
    /// In [`RunMode::Loop`] the only other return is
    /// `ErrorBudgetExhausted`; in [`RunMode::SinglePass`] one pass runs and
    /// its failure, if any, is absorbed like any other pass failure. The
    /// error returned is also kept for [`HealthReporter::exit_error`].
    ///
    /// # Errors
    ///
    /// Returns setup errors and the exhausted error budget.
    pub async fn process_events(&self, mode: RunMode) -> Result<()> {
        *self.shared.exit_error.write().await = None;

        if self.registry.is_empty() {
            error!("no event processors registered - exiting event processing loop");
            return self.exit(DispatchError::NoProcessorsRegistered).await;
        }

        let Some(connection) = self.shared.connection.read().await.clone() else {
            error!("not connected to database - exiting event processing loop");
            return self.exit(DispatchError::NotConnected).await;
        };

        let mut consecutive_errors: u32 = 0;
        self.shared.stats.write().await.consecutive_errors = 0;

        loop {
            let outcome = self.run_pass(&connection).await;
            self.shared.stats.write().await.passes += 1;

            let failure = match outcome {
                Ok(PassOutcome::Idle) => {
                    self.shared.stats.write().await.idle_passes += 1;
                    info!(delay = ?self.config.idle_delay, "no pending events");
                    self.clock.sleep(self.config.idle_delay).await;
                    None
                },
                Ok(PassOutcome::Dispatched(summary)) => {
                    {
                        let mut stats = self.shared.stats.write().await;
                        stats.events_dispatched += summary.dispatched;
                        stats.rows_deleted += summary.rows_deleted;
                        stats.handler_failures += summary.handler_failures;
                        stats.missing_events += summary.missing;
                    }
                    debug!(
                        rows = summary.rows,
                        rows_deleted = summary.rows_deleted,
                        missing = summary.missing,
                        "dispatch pass committed"
                    );

                    match summary.last_missing {
                        None => {
                            consecutive_errors = 0;
                            self.shared.stats.write().await.consecutive_errors = 0;
                            None
                        },
                        Some(e) => {
                            // Nothing else moved; back off before polling the same rows.
                            if summary.dispatched == 0 {
                                self.clock.sleep(self.config.error_delay).await;
                            }
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            Some(e)
                        },
                    }
                },
                Err(e) => {
                    warn!(
                        error = %e,
                        category = %e.category(),
                        consecutive_errors,
                        "dispatch pass failed"
                    );
                    self.clock.sleep(self.config.error_delay).await;

                    if e.is_connection_error() && self.try_reconnect(&connection).await {
                        consecutive_errors = 0;
                    } else {
                        consecutive_errors = consecutive_errors.saturating_add(1);
                    }
                    self.shared.stats.write().await.failed_passes += 1;
                    Some(e)
                },
            };

            if let Some(e) = failure {
                self.shared.stats.write().await.consecutive_errors = consecutive_errors;

                if consecutive_errors > self.config.max_consecutive_errors {
                    error!(
                        consecutive_errors,
                        error = %e,
                        "error budget exhausted - exiting event processing loop"
                    );
                    return self
                        .exit(DispatchError::ErrorBudgetExhausted {
                            consecutive_errors,
                            last_error: Box::new(e),
                        })
                        .await;
                }
            }

            if mode == RunMode::SinglePass {
                return Ok(());
            }
        }
    }

    async fn exit(&self, error: DispatchError) -> Result<()> {
        *self.shared.exit_error.write().await = Some(error.clone());
        Err(error)
    }

    /// Replaces the handle after a connection-class failure.
    ///
    /// A handle that still answers a ping is kept: the failure came from
    /// something a fresh pool would hit again, such as pool exhaustion.
    async fn try_reconnect(&self, connection: &Connection) -> bool {
        if connection.ping().await {
            warn!("database still answers; counting the failure instead of reconnecting");
            return false;
        }

        match connection.reconnect(self.config.reconnect_attempts).await {
            Ok(()) => {
                self.shared.stats.write().await.reconnects += 1;
                true
            },
            Err(e) => {
                warn!(error = %e, "reconnect failed");
                false
            },
        }
    }

    async fn run_pass(&self, connection: &Connection) -> Result<PassOutcome> {
        let storage = connection.storage().await;
        let db = storage.db_handle();

        debug!("beginning dispatch pass");
        let mut tx = storage.begin().await?;

        match self.dispatch_batch(storage.as_ref(), tx.as_mut(), db).await {
            Ok(summary) if summary.rows == 0 => {
                tx.rollback().await?;
                Ok(PassOutcome::Idle)
            },
            Ok(summary) => {
                tx.commit().await?;
                Ok(PassOutcome::Dispatched(summary))
            },
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "rollback after failed pass also failed");
                }
                Err(e)
            },
        }
    }

    async fn dispatch_batch(
        &self,
        storage: &dyn PublishStorage,
        tx: &mut dyn PublishTransaction,
        db: Option<PgPool>,
    ) -> Result<BatchSummary> {
        let rows =
            tx.poll_pending(self.config.effective_batch_size(), self.config.lock_mode).await?;
        debug!(rows = rows.len(), "polled pending events");

        let mut summary = BatchSummary { rows: rows.len(), ..BatchSummary::default() };

        for key in rows {
            let Some(event) = fetch_event(storage, &key).await? else {
                let missing = DispatchError::event_not_found(key.aggregate_id.clone(), key.version);
                warn!(
                    aggregate_id = %key.aggregate_id,
                    version = key.version,
                    error = %missing,
                    "queued event has no log entry, leaving it queued"
                );
                summary.missing += 1;
                summary.last_missing = Some(missing);
                continue;
            };

            let (deleted, failures) = self.dispatch_event(tx, &key, &event, &db).await?;
            summary.dispatched += 1;
            summary.rows_deleted += deleted;
            summary.handler_failures += failures;
        }

        Ok(summary)
    }

    /// Hands one event to every processor.
    ///
    /// The row is deleted after each success; repeated deletes are no-ops.
    async fn dispatch_event(
        &self,
        tx: &mut dyn PublishTransaction,
        key: &PendingEventRef,
        event: &EventRecord,
        db: &Option<PgPool>,
    ) -> Result<(u64, u64)> {
        let mut deleted = 0;
        let mut failures = 0;

        for registration in self.registry.iter() {
            match registration.process(db.clone(), event.clone()).await {
                Ok(()) => {
                    deleted += tx.delete_pending(key.clone()).await?;
                    debug!(
                        processor = registration.name(),
                        aggregate_id = %key.aggregate_id,
                        version = key.version,
                        "event processed"
                    );
                },
                Err(e) => {
                    failures += 1;
                    warn!(
                        processor = registration.name(),
                        aggregate_id = %key.aggregate_id,
                        version = key.version,
                        error = %e,
                        "event processor failed"
                    );
                },
            }
        }

        Ok((deleted, failures))
    }
}

async fn fetch_event(
    storage: &dyn PublishStorage,
    key: &PendingEventRef,
) -> Result<Option<EventRecord>> {
    debug!(aggregate_id = %key.aggregate_id, version = key.version, "fetching event");
    Ok(storage.find_event(key.clone()).await?)
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("processors", &self.registry.names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
