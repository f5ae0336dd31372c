//! HTTP-facing error type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use eventpub_core::CoreError;
use thiserror::Error;

/// Errors a feed handler can answer with.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The feed store failed.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// The requested page does not exist.
    #[error("feed not found: {0}")]
    NotFound(String),

    /// The feed document could not be written.
    #[error("failed to serialize feed: {0}")]
    Serialization(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "Feed not found"),
            Self::Storage(_) | Self::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            },
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_variant() {
        assert_eq!(
            ApiError::NotFound("feed-1".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Storage(CoreError::Connection("refused".into())).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Serialization("bad".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
