//! Atom feed endpoints over the linked feed pages.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};

use crate::{
    atom::{truncate_to_hour, Feed, ATOM_CONTENT_TYPE},
    error::ApiError,
    AppState,
};

/// Serves the page currently being filled.
///
/// Answers 204 when the store has no current page yet.
#[instrument(name = "recent_feed", skip(app_state))]
pub async fn recent_feed(State(app_state): State<AppState>) -> Response {
    match build_recent(&app_state).await {
        Ok(Some(xml)) => atom_response(xml),
        Ok(None) => {
            info!("No current feed page");
            StatusCode::NO_CONTENT.into_response()
        },
        Err(e) => {
            error!(error = %e, "Failed to build recent feed");
            e.into_response()
        },
    }
}

/// Serves a page by identifier.
#[instrument(name = "feed_page", skip(app_state))]
pub async fn feed_page(State(app_state): State<AppState>, Path(feed_id): Path<String>) -> Response {
    match build_page(&app_state, &feed_id).await {
        Ok(xml) => atom_response(xml),
        Err(e @ ApiError::NotFound(_)) => {
            info!(feed_id = %feed_id, "Feed page not found");
            e.into_response()
        },
        Err(e) => {
            error!(feed_id = %feed_id, error = %e, "Failed to build feed page");
            e.into_response()
        },
    }
}

async fn build_recent(app_state: &AppState) -> Result<Option<String>, ApiError> {
    let Some(feed_id) = app_state.feeds.current_feed_id().await? else {
        return Ok(None);
    };

    let previous = app_state.feeds.find_page(&feed_id).await?.and_then(|page| page.previous);
    let now = DateTime::<Utc>::from(app_state.clock.now_system());

    let settings = &app_state.feed;
    let mut feed = Feed::new(settings.title(), feed_id.as_str(), truncate_to_hour(now));
    feed.push_link("self", settings.href("recent"));
    feed.push_link("via", settings.href(&feed_id));
    if let Some(previous) = previous {
        feed.push_link("previous", settings.href(&previous));
    }

    debug!(feed_id = %feed_id, links = feed.links.len(), "Built recent feed");
    feed.to_xml().map(Some)
}

async fn build_page(app_state: &AppState, feed_id: &str) -> Result<String, ApiError> {
    let page = app_state
        .feeds
        .find_page(feed_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(feed_id.to_string()))?;

    let next = app_state.feeds.find_next(feed_id).await?;
    let updated =
        app_state.feeds.last_updated(feed_id).await?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let settings = &app_state.feed;
    let mut feed = Feed::new(settings.title(), page.feed_id.as_str(), updated);
    feed.push_link("self", settings.href(&page.feed_id));
    if let Some(previous) = &page.previous {
        feed.push_link("previous", settings.href(previous));
    }
    if let Some(next) = &next {
        feed.push_link("next", settings.href(next));
    }

    debug!(feed_id = %feed_id, links = feed.links.len(), "Built feed page");
    feed.to_xml()
}

fn atom_response(xml: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, ATOM_CONTENT_TYPE)], xml).into_response()
}
