use crate::poller::fetch::{Credentials, FetchError, FetchResult, Fetcher};
use crate::poller::subscription::Subscription;
use crate::poller::TrackerKind;
use crate::trackers::{get_json, parse_time, unescape_html};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const TITLE_LIMIT: usize = 500;

pub struct YouTubeFetcher {
    client: reqwest::Client,
}

impl YouTubeFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn uploads_playlist(&self, api_key: &str, channel_id: &str) -> Result<String, FetchError> {
        let request = self.client.get(format!("{}/channels", API_BASE)).query(&[
            ("part", "id,contentDetails"),
            ("id", channel_id),
            ("key", api_key),
        ]);
        let body = get_json(request, &format!("channel {}", channel_id)).await?;
        Self::parse_uploads_playlist(&body)
            .ok_or_else(|| FetchError::NotFound(format!("channel {}", channel_id)))
    }

    pub fn parse_uploads_playlist(body: &Value) -> Option<String> {
        body.pointer("/items/0/contentDetails/relatedPlaylists/uploads")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Newest entry of a `playlistItems` listing.
    pub fn parse_latest_video(body: &Value) -> Result<FetchResult, FetchError> {
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Malformed("playlist listing without items".to_string()))?;
        let snippet = items
            .first()
            .and_then(|item| item.get("snippet"))
            .and_then(Value::as_object)
            .ok_or_else(|| FetchError::NotFound("no uploads yet".to_string()))?;

        let text = |key: &str| {
            snippet
                .get(key)
                .and_then(Value::as_str)
                .map(unescape_html)
                .ok_or_else(|| FetchError::Malformed(format!("video snippet missing {}", key)))
        };
        let video_id = snippet
            .get("resourceId")
            .and_then(|r| r.get("videoId"))
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Malformed("video snippet missing videoId".to_string()))?
            .to_string();
        let timestamp = parse_time(&text("publishedAt")?)?;
        let channel_title = text("channelTitle")?;

        // Every plain string in the snippet is usable as a template token
        let mut payload: BTreeMap<String, String> = snippet
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), unescape_html(s))))
            .collect();
        payload.insert("videoId".to_string(), video_id.clone());
        payload.insert("author".to_string(), channel_title.clone());

        Ok(FetchResult {
            timestamp,
            url: format!("https://www.youtube.com/watch?v={}", video_id),
            fingerprint: video_id,
            display_name: channel_title,
            payload,
        })
    }
}

#[async_trait]
impl Fetcher for YouTubeFetcher {
    fn kind(&self) -> TrackerKind {
        TrackerKind::YouTube
    }

    async fn fetch(
        &self,
        credentials: &Credentials,
        subscription: &Subscription,
    ) -> Result<FetchResult, FetchError> {
        let playlist = match &subscription.upstream_ref {
            Some(playlist) => playlist.clone(),
            None => {
                self.uploads_playlist(&credentials.token, &subscription.external_id)
                    .await?
            }
        };
        let request = self
            .client
            .get(format!("{}/playlistItems", API_BASE))
            .query(&[
                ("part", "id,snippet"),
                ("playlistId", playlist.as_str()),
                ("maxResults", "1"),
                ("key", credentials.token.as_str()),
            ]);
        let body = get_json(request, &format!("playlist {}", playlist)).await?;
        Self::parse_latest_video(&body)
    }

    async fn prepare(
        &self,
        credentials: &Credentials,
        subscription: &mut Subscription,
    ) -> Result<bool, FetchError> {
        if subscription.upstream_ref.is_some() {
            return Ok(false);
        }
        let playlist = self
            .uploads_playlist(&credentials.token, &subscription.external_id)
            .await?;
        subscription.upstream_ref = Some(playlist);
        Ok(true)
    }

    fn default_message(&self, fetch: &FetchResult) -> String {
        let title = fetch.field("title").unwrap_or_default();
        format!(
            "New video from *{}*:\n**{}**\n{}",
            truncate(&fetch.display_name),
            truncate(title),
            fetch.url
        )
    }

    fn link_custom_messages(&self) -> bool {
        true
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(TITLE_LIMIT).collect()
}
