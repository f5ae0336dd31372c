//! Error types and result handling for event store operations.
//!
//! The taxonomy separates connectivity failures, which a fresh connection
//! may cure, from logical failures (bad query, constraint violation,
//! missing row), which it cannot. Every sqlx error is mapped into one of the
//! two classes at the repository boundary.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// SQLSTATE codes outside class `08` that still mean the server dropped us.
const DISCONNECT_SQLSTATES: [&str; 3] = ["57P01", "57P02", "57P03"];

/// Core error type for storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed for a logical reason.
    #[error("Database error: {0}")]
    Database(String),

    /// The connection to the database is broken or unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns whether this error belongs to the connectivity class.
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Returns whether a SQLSTATE code reports a lost or refused connection.
pub fn is_disconnect_sqlstate(code: &str) -> bool {
    code.starts_with("08") || DISCONNECT_SQLSTATES.contains(&code)
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            sqlx::Error::Database(db_err)
                if db_err.code().is_some_and(|code| is_disconnect_sqlstate(&code)) =>
            {
                Self::Connection(db_err.to_string())
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
