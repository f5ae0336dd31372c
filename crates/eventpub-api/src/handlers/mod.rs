//! HTTP request handlers.
//!
//! - `feed` - Atom feed pages under `/notifications`
//! - `health` - health and liveness checks

pub mod feed;
pub mod health;

pub use feed::{feed_page, recent_feed};
pub use health::{health_check, liveness_check};
