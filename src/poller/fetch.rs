use crate::poller::subscription::Subscription;
use crate::poller::TrackerKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Latest version of one external resource, as seen during a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub timestamp: DateTime<Utc>,
    pub fingerprint: String,
    pub display_name: String,
    pub url: String,
    /// Extra fields exposed to custom templates as `%key%`.
    pub payload: BTreeMap<String, String>,
}

impl FetchResult {
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.display_name),
            "url" => Some(&self.url),
            _ => self.payload.get(key).map(String::as_str),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub client_id: Option<String>,
}

impl Credentials {
    pub fn api_key(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("upstream request failed: {0}")]
    Http(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Http(err.to_string())
        }
    }
}

/// Upstream adapter for one tracker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn kind(&self) -> TrackerKind;

    async fn fetch(
        &self,
        credentials: &Credentials,
        subscription: &Subscription,
    ) -> Result<FetchResult, FetchError>;

    /// Resolve upstream locators for a subscription. Returns whether it changed.
    async fn prepare(
        &self,
        _credentials: &Credentials,
        _subscription: &mut Subscription,
    ) -> Result<bool, FetchError> {
        Ok(false)
    }

    fn default_message(&self, fetch: &FetchResult) -> String {
        format!(
            "A new update for **{}** is available:\n<{}>",
            fetch.display_name, fetch.url
        )
    }

    /// Whether custom messages get the resource link appended when they don't use `%url%`.
    fn link_custom_messages(&self) -> bool {
        false
    }
}
