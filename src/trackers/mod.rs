//! Upstream adapters implementing [`Fetcher`](crate::poller::fetch::Fetcher).
//!
//! Each adapter keeps response parsing in a pure function so it can be tested
//! against captured JSON without touching the network.

pub mod curseforge;
pub mod twitch;
pub mod youtube;

use crate::poller::fetch::FetchError;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::time::Duration;

pub fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("trackbot/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map a non-success status to a fetch error. `what` names the resource.
pub(crate) fn status_error(status: StatusCode, what: &str) -> FetchError {
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
        other => FetchError::Http(format!("{} returned {}", what, other)),
    }
}

pub(crate) async fn get_json(
    request: reqwest::RequestBuilder,
    what: &str,
) -> Result<serde_json::Value, FetchError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, what));
    }
    Ok(response.json().await?)
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::Malformed(format!("bad timestamp '{}': {}", raw, e)))
}

/// Decode the HTML entities upstream APIs leave in titles.
pub(crate) fn unescape_html(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}
