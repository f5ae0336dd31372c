//! Atom feed documents.
//!
//! Only the feed-level elements the notification pages carry are modelled:
//! title, id, updated, and the navigation links.

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;

use crate::error::ApiError;

/// Atom XML namespace.
pub const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";

/// Content type of serialized feed documents.
pub const ATOM_CONTENT_TYPE: &str = "application/atom+xml";

/// A feed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename = "feed")]
pub struct Feed {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    /// Feed title.
    pub title: String,
    /// Feed page identifier.
    pub id: String,
    /// RFC 3339 timestamp of the last update.
    pub updated: String,
    /// Navigation links, in document order.
    #[serde(rename = "link")]
    pub links: Vec<Link>,
}

/// A navigation link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    /// Link relation such as `self` or `previous`.
    #[serde(rename = "@rel")]
    pub rel: String,
    /// Target URL.
    #[serde(rename = "@href")]
    pub href: String,
}

impl Feed {
    /// Creates a feed document with no links.
    pub fn new(title: impl Into<String>, id: impl Into<String>, updated: DateTime<Utc>) -> Self {
        Self {
            xmlns: ATOM_NAMESPACE,
            title: title.into(),
            id: id.into(),
            updated: updated.to_rfc3339_opts(SecondsFormat::Secs, true),
            links: Vec::new(),
        }
    }

    /// Appends a link.
    pub fn push_link(&mut self, rel: impl Into<String>, href: impl Into<String>) {
        self.links.push(Link { rel: rel.into(), href: href.into() });
    }

    /// Serializes the document to XML.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Serialization` if the writer rejects the document.
    pub fn to_xml(&self) -> Result<String, ApiError> {
        quick_xml::se::to_string(self).map_err(|e| ApiError::Serialization(e.to_string()))
    }
}

/// Truncates a timestamp to the start of its hour.
pub fn truncate_to_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(TimeDelta::hours(1)).unwrap_or(time)
}
