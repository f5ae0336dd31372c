//! Read access to the linked feed pages.
//!
//! Handlers read through [`FeedStore`] so routing and document assembly
//! can be tested against [`MemoryFeedStore`] without a database.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use eventpub_core::{models::FeedPage, storage::Storage, CoreError, Result};

/// Lookups the feed handlers need.
pub trait FeedStore: Send + Sync + 'static {
    /// Identifier of the page currently being filled.
    fn current_feed_id(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;

    /// Page with the given identifier.
    fn find_page<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FeedPage>>> + Send + 'a>>;

    /// Page that names `feed_id` as its previous page.
    fn find_next<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    /// Timestamp of the newest entry on a page.
    fn last_updated<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a>>;

    /// No-op round trip used by the health endpoint.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Feed store backed by the Postgres feed tables.
pub struct PostgresFeedStore {
    storage: Arc<Storage>,
}

impl PostgresFeedStore {
    /// Creates a feed store over the given storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl FeedStore for PostgresFeedStore {
    fn current_feed_id(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move { self.storage.feeds.current_feed_id().await })
    }

    fn find_page<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FeedPage>>> + Send + 'a>> {
        Box::pin(async move { self.storage.feeds.find(feed_id).await })
    }

    fn find_next<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move { self.storage.feeds.find_next(feed_id).await })
    }

    fn last_updated<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a>> {
        Box::pin(async move { self.storage.feeds.last_updated(feed_id).await })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

#[derive(Default)]
struct MemoryState {
    current: Option<String>,
    pages: Vec<FeedPage>,
    updated: HashMap<String, DateTime<Utc>>,
    failing: bool,
    unhealthy: bool,
}

/// In-memory feed store for tests.
///
/// Clones share state, so a test can keep a handle after passing the store
/// into the router.
#[derive(Clone, Default)]
pub struct MemoryFeedStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFeedStore {
    /// Creates an empty store with no current page.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page linked back to `previous`.
    pub fn add_page(&self, feed_id: &str, previous: Option<&str>) {
        self.state().pages.push(FeedPage {
            feed_id: feed_id.to_string(),
            previous: previous.map(str::to_string),
        });
    }

    /// Names the page currently being filled.
    pub fn set_current(&self, feed_id: Option<&str>) {
        self.state().current = feed_id.map(str::to_string);
    }

    /// Records the newest entry timestamp of a page.
    pub fn set_last_updated(&self, feed_id: &str, time: DateTime<Utc>) {
        self.state().updated.insert(feed_id.to_string(), time);
    }

    /// Makes every lookup fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Makes the health check succeed or fail.
    pub fn set_healthy(&self, healthy: bool) {
        self.state().unhealthy = !healthy;
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> Result<T> {
        let state = self.state();
        if state.failing {
            return Err(CoreError::Database("injected feed store failure".to_string()));
        }
        Ok(f(&state))
    }
}

impl FeedStore for MemoryFeedStore {
    fn current_feed_id(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        let result = self.read(|state| state.current.clone());
        Box::pin(async move { result })
    }

    fn find_page<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FeedPage>>> + Send + 'a>> {
        let result =
            self.read(|state| state.pages.iter().find(|page| page.feed_id == feed_id).cloned());
        Box::pin(async move { result })
    }

    fn find_next<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        let result = self.read(|state| {
            state
                .pages
                .iter()
                .find(|page| page.previous.as_deref() == Some(feed_id))
                .map(|page| page.feed_id.clone())
        });
        Box::pin(async move { result })
    }

    fn last_updated<'a>(
        &'a self,
        feed_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a>> {
        let result = self.read(|state| state.updated.get(feed_id).copied());
        Box::pin(async move { result })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let result = if self.state().unhealthy {
            Err(CoreError::Connection("feed store unreachable".to_string()))
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }
}
