//! Read-only health view over a running dispatcher.

use std::sync::Arc;

use crate::{
    engine::{DispatchStats, SharedState},
    error::DispatchError,
};

/// Cloneable handle answering health questions about one dispatcher.
///
/// Safe to query while the loop is running; it never opens a transaction.
#[derive(Clone)]
pub struct HealthReporter {
    shared: Arc<SharedState>,
}

impl HealthReporter {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// True when the loop has not exited with an error and the database
    /// answers a ping.
    pub async fn is_healthy(&self) -> bool {
        self.exit_error().await.is_none() && self.is_connection_healthy().await
    }

    /// Error the loop last exited with, if any.
    pub async fn exit_error(&self) -> Option<DispatchError> {
        self.shared.exit_error.read().await.clone()
    }

    /// Whether the held connection currently answers a ping.
    ///
    /// False when no connection has been established.
    pub async fn is_connection_healthy(&self) -> bool {
        let connection = self.shared.connection.read().await.clone();
        match connection {
            Some(connection) => connection.ping().await,
            None => false,
        }
    }

    /// Snapshot of the dispatcher's activity counters.
    pub async fn stats(&self) -> DispatchStats {
        self.shared.stats.read().await.clone()
    }
}

impl std::fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthReporter").finish_non_exhaustive()
    }
}
