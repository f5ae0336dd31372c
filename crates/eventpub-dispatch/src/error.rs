//! Error types for dispatcher operations.
//!
//! Only setup errors and the exhausted error budget ever leave
//! [`Dispatcher::process_events`](crate::Dispatcher::process_events);
//! everything else is classified, possibly recovered from, and counted
//! inside the loop. Storage failures are carried as messages so the error
//! stays `Clone` and can be parked in the dispatcher's exit slot.

use std::fmt;

use eventpub_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised while registering, connecting, or dispatching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The loop was started with an empty registry.
    #[error("no event processors registered - exiting event processing loop")]
    NoProcessorsRegistered,

    /// The loop was started before a connection was established.
    #[error("not connected to database - call connect first")]
    NotConnected,

    /// A processor was registered without both callbacks.
    #[error("event processor {name} registered with a missing callback")]
    InvalidRegistration {
        /// Name the registration was attempted under
        name: String,
    },

    /// A processor's initialize callback failed.
    #[error("event processor {processor} failed to initialize: {message}")]
    Initialization {
        /// Name of the failing processor
        processor: String,
        /// Failure reported by the callback
        message: String,
    },

    /// Opening or verifying a connection failed on every attempt.
    #[error("failed to connect after {attempts} attempts: {message}")]
    Connect {
        /// Number of attempts made
        attempts: u32,
        /// Failure from the last attempt
        message: String,
    },

    /// A queue row referenced an event missing from the log.
    #[error("aggregate {aggregate_id} version {version} not found")]
    EventNotFound {
        /// Aggregate of the dangling reference
        aggregate_id: String,
        /// Version of the dangling reference
        version: i32,
    },

    /// The database connection broke during an operation.
    #[error("connection error: {message}")]
    Connection {
        /// Driver error message
        message: String,
    },

    /// A database operation failed for a logical reason.
    #[error("database error: {message}")]
    Database {
        /// Driver error message
        message: String,
    },

    /// The loop saw more consecutive failures than it tolerates.
    #[error("giving up after {consecutive_errors} consecutive errors: {last_error}")]
    ErrorBudgetExhausted {
        /// Consecutive failures counted when the loop gave up
        consecutive_errors: u32,
        /// The failure that crossed the threshold
        last_error: Box<DispatchError>,
    },
}

impl DispatchError {
    /// Creates a connection-class error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a logical database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates an event-not-found error for a queue key.
    pub fn event_not_found(aggregate_id: impl Into<String>, version: i32) -> Self {
        Self::EventNotFound { aggregate_id: aggregate_id.into(), version }
    }

    /// Returns whether a fresh connection could cure this failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Connect { .. })
    }

    /// Returns the broad class of this error.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        if err.is_connection_error() {
            Self::connection(err.to_string())
        } else {
            Self::database(err.to_string())
        }
    }
}

/// Broad class of a dispatcher error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller misuse, fatal immediately and never retried.
    Setup,
    /// Broken connectivity, recovered by reconnecting.
    Connectivity,
    /// Query, constraint, or data errors counted toward the budget.
    Logical,
    /// The consecutive-error budget is spent.
    Fatal,
}

impl From<&DispatchError> for ErrorCategory {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::NoProcessorsRegistered
            | DispatchError::NotConnected
            | DispatchError::InvalidRegistration { .. }
            | DispatchError::Initialization { .. } => Self::Setup,
            DispatchError::Connect { .. } | DispatchError::Connection { .. } => Self::Connectivity,
            DispatchError::EventNotFound { .. } | DispatchError::Database { .. } => Self::Logical,
            DispatchError::ErrorBudgetExhausted { .. } => Self::Fatal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Connectivity => write!(f, "connectivity"),
            Self::Logical => write!(f, "logical"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_identified() {
        assert!(DispatchError::connection("socket closed").is_connection_error());
        assert!(DispatchError::Connect { attempts: 3, message: "refused".into() }
            .is_connection_error());

        assert!(!DispatchError::database("syntax error").is_connection_error());
        assert!(!DispatchError::event_not_found("a", 1).is_connection_error());
        assert!(!DispatchError::NotConnected.is_connection_error());
    }

    #[test]
    fn core_errors_keep_their_class() {
        let lost = DispatchError::from(CoreError::Connection("reset".into()));
        assert_eq!(lost.category(), ErrorCategory::Connectivity);

        let logical = DispatchError::from(CoreError::ConstraintViolation("dup".into()));
        assert_eq!(logical.category(), ErrorCategory::Logical);
    }

    #[test]
    fn setup_and_fatal_categories() {
        assert_eq!(DispatchError::NoProcessorsRegistered.category(), ErrorCategory::Setup);
        assert_eq!(
            DispatchError::InvalidRegistration { name: "audit".into() }.category(),
            ErrorCategory::Setup
        );

        let fatal = DispatchError::ErrorBudgetExhausted {
            consecutive_errors: 101,
            last_error: Box::new(DispatchError::database("boom")),
        };
        assert_eq!(fatal.category(), ErrorCategory::Fatal);
        assert_eq!(
            fatal.to_string(),
            "giving up after 101 consecutive errors: database error: boom"
        );
    }

    #[test]
    fn missing_event_names_the_key() {
        let error = DispatchError::event_not_found("order-9", 4);
        assert_eq!(error.to_string(), "aggregate order-9 version 4 not found");
    }
}
