//! Competing-consumers dispatcher for the event store publish queue.
//!
//! Events appended to the log are also referenced from a transient publish
//! table. A [`Dispatcher`] polls that table, hands each referenced event
//! to the registered [`EventProcessor`]s, and deletes the row once handled.
//! Any number of dispatchers may share one queue; row-level locks taken by
//! the poll keep them from handling the same rows at the same time.
//!
//! # Architecture
//!
//! 1. **Registry** - named processors, each an initialize and a process
//!    callback
//! 2. **Connection** - verified storage handle with bounded reconnect
//! 3. **Engine** - the poll, fetch, dispatch, delete, commit loop with a
//!    consecutive-error budget
//! 4. **Health** - read-only view of the loop's exit state and the
//!    connection's liveness
//!
//! Delivery is at least once. A row is deleted as soon as one processor
//! succeeds, so processors must be idempotent and independent of one
//! another.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod engine;
pub mod error;
pub mod health;
pub mod registry;
pub mod storage;

pub use connection::{connect_pool, is_connection_error, Connection};
pub use engine::{DispatchConfig, DispatchStats, Dispatcher, RunMode, MAX_BATCH_SIZE};
pub use error::{DispatchError, ErrorCategory, Result};
pub use health::HealthReporter;
pub use registry::{EventProcessor, Registration, Registry};
pub use storage::{
    Connector, PgConnector, PostgresPublishStorage, PublishStorage, PublishTransaction,
    MIN_POOL_CONNECTIONS,
};
