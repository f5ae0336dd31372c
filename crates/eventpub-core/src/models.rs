//! Queue and log records of the event store.
//!
//! A [`PendingEventRef`] is a row of the publish table and carries no
//! payload: it points at an [`EventRecord`] in the append-only log by the
//! same `(aggregate_id, version)` key.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A pending row in the publish table.
///
/// Created by the write path when an event is appended; deleted by a
/// dispatcher once a processor has handled the referenced event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingEventRef {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Position of the event within its aggregate.
    pub version: i32,
}

impl PendingEventRef {
    /// Creates a reference to the given aggregate version.
    pub fn new(aggregate_id: impl Into<String>, version: i32) -> Self {
        Self { aggregate_id: aggregate_id.into(), version }
    }
}

impl fmt::Display for PendingEventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.aggregate_id, self.version)
    }
}

/// An immutable event body from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Position of the event within its aggregate.
    pub version: i32,
    /// Event type tag.
    pub type_code: String,
    /// Opaque serialized event body.
    pub payload: Bytes,
}

impl EventRecord {
    /// Creates an event record.
    pub fn new(
        aggregate_id: impl Into<String>,
        version: i32,
        type_code: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version,
            type_code: type_code.into(),
            payload: payload.into(),
        }
    }

    /// Returns the queue key addressing this event.
    pub fn key(&self) -> PendingEventRef {
        PendingEventRef::new(self.aggregate_id.clone(), self.version)
    }
}

/// A page of the read-side feed, linked backwards to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPage {
    /// Page identifier.
    pub feed_id: String,
    /// Identifier of the preceding page, if any.
    pub previous: Option<String>,
}
