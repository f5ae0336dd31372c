//! Registry of named event processors.
//!
//! Each processor is a pair of callbacks: `initialize`, run once before
//! dispatching starts, and `process`, run for every dispatched event.
//! Processors are kept in insertion order so test expectations are
//! deterministic, but callers must not depend on that order. Every
//! processor sees an event independently of the others.

use std::{fmt, sync::Arc};

use eventpub_core::EventRecord;
use futures::future::BoxFuture;
use sqlx::PgPool;

use crate::error::{DispatchError, Result};

/// Callback run once per processor before dispatching starts.
pub type InitializeFn =
    Arc<dyn Fn(Option<PgPool>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback run for every dispatched event.
pub type ProcessFn =
    Arc<dyn Fn(Option<PgPool>, EventRecord) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Builder for a processor registration.
///
/// # Example
///
/// ```
/// use eventpub_dispatch::EventProcessor;
///
/// let processor = EventProcessor::new()
///     .on_initialize(|_db| async { Ok(()) })
///     .on_process(|_db, event| async move {
///         tracing::info!(aggregate_id = %event.aggregate_id, "seen");
///         Ok(())
///     });
/// assert!(processor.is_complete());
/// ```
#[derive(Clone, Default)]
pub struct EventProcessor {
    initialize: Option<InitializeFn>,
    process: Option<ProcessFn>,
}

impl EventProcessor {
    /// Creates a processor with no callbacks set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initialize callback.
    #[must_use]
    pub fn on_initialize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<PgPool>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let initialize: InitializeFn =
            Arc::new(move |db: Option<PgPool>| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(f(db))
            });
        self.initialize = Some(initialize);
        self
    }

    /// Sets the process callback.
    #[must_use]
    pub fn on_process<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<PgPool>, EventRecord) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let process: ProcessFn = Arc::new(
            move |db: Option<PgPool>, event: EventRecord| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(f(db, event))
            },
        );
        self.process = Some(process);
        self
    }

    /// Returns whether both callbacks are set.
    pub fn is_complete(&self) -> bool {
        self.initialize.is_some() && self.process.is_some()
    }
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessor")
            .field("initialize", &self.initialize.is_some())
            .field("process", &self.process.is_some())
            .finish()
    }
}

/// A validated registration: both callbacks present.
#[derive(Clone)]
pub struct Registration {
    name: String,
    initialize: InitializeFn,
    process: ProcessFn,
}

impl Registration {
    /// Name the processor was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the initialize callback.
    pub fn initialize(&self, db: Option<PgPool>) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.initialize)(db)
    }

    /// Runs the process callback for one event.
    pub fn process(
        &self,
        db: Option<PgPool>,
        event: EventRecord,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.process)(db, event)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Named processors owned by one dispatcher.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<Registration>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor under `name`, replacing any earlier one.
    ///
    /// A replaced processor keeps its position in iteration order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistration` if either callback is missing.
    pub fn register(&mut self, name: impl Into<String>, processor: EventProcessor) -> Result<()> {
        let name = name.into();
        let (Some(initialize), Some(process)) = (processor.initialize, processor.process) else {
            return Err(DispatchError::InvalidRegistration { name });
        };

        let registration = Registration { name, initialize, process };
        match self.entries.iter_mut().find(|entry| entry.name == registration.name) {
            Some(existing) => *existing = registration,
            None => self.entries.push(registration),
        }
        Ok(())
    }

    /// Removes every registration.
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Number of registered processors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no processor is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in iteration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(Registration::name).collect()
    }

    /// Iterates registrations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }
}
