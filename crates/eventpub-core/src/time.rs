//! Clock abstraction for the dispatcher's delays and the feed's timestamps.
//!
//! Every sleep in the pipeline (idle backoff, error backoff, connect retry)
//! goes through a [`Clock`], so tests can run thousands of passes without
//! waiting in real time.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by system time and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// Sleeping advances virtual time by the requested duration and yields to
/// the scheduler instead of blocking. Clones share the same timeline, so a
/// test can hand one clone to the dispatcher and inspect another.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    sleeps: Arc<AtomicU64>,
    start_system: SystemTime,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific system time.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            sleeps: Arc::new(AtomicU64::new(0)),
            start_system: start,
            base_instant: Instant::now(),
        }
    }

    /// Advances virtual time without counting a sleep.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Total virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Number of `sleep` calls made against this clock.
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::Acquire)
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.start_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        self.sleeps.fetch_add(1, Ordering::AcqRel);
        Box::pin(tokio::task::yield_now())
    }
}
