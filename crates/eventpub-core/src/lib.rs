//! Core data types and persistence for the event publish pipeline.
//!
//! Provides the queue and log record types, the error taxonomy shared by
//! every crate (including the connection-class classification of database
//! failures), the clock abstraction used for all delays, and the Postgres
//! repositories over the event store tables.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{EventRecord, FeedPage, PendingEventRef};
pub use time::{Clock, RealClock, TestClock};
