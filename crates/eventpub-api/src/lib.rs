//! Eventpub HTTP API.
//!
//! Serves the read-side Atom feed over the event store's linked feed pages
//! and the service health endpoints.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod atom;
pub mod config;
pub mod error;
pub mod feed_store;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::ApiError;
pub use feed_store::{FeedStore, MemoryFeedStore, PostgresFeedStore};
pub use server::{create_router, start_server, AppState, FeedSettings};
