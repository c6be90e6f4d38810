use crate::poller::fetch::{Credentials, FetchError, FetchResult, Fetcher};
use crate::poller::subscription::Subscription;
use crate::poller::TrackerKind;
use crate::trackers::{get_json, parse_time};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

const API_BASE: &str = "https://api.twitch.tv/helix";
/// Segments requested when polling for the next stream
const POLL_SEGMENTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    data: Schedule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    pub broadcaster_name: String,
    pub broadcaster_login: String,
    #[serde(default)]
    pub segments: Option<Vec<Segment>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    pub id: String,
    pub start_time: String,
    pub title: String,
    #[serde(default)]
    pub canceled_until: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub name: String,
}

impl Segment {
    pub fn is_canceled(&self) -> bool {
        self.canceled_until.is_some()
    }
}

pub struct TwitchFetcher {
    client: reqwest::Client,
}

impl TwitchFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn schedule(
        &self,
        credentials: &Credentials,
        broadcaster_id: &str,
        first: u32,
    ) -> Result<Schedule, FetchError> {
        let client_id = credentials
            .client_id
            .as_deref()
            .ok_or_else(|| FetchError::Http("Twitch client id is not configured".to_string()))?;
        let first = first.to_string();
        let request = self
            .client
            .get(format!("{}/schedule", API_BASE))
            .query(&[("broadcaster_id", broadcaster_id), ("first", first.as_str())])
            .header("Client-Id", client_id)
            .bearer_auth(&credentials.token);
        let body = get_json(request, &format!("schedule for {}", broadcaster_id)).await?;
        Self::parse_schedule(body)
    }

    pub fn parse_schedule(body: serde_json::Value) -> Result<Schedule, FetchError> {
        let response: ScheduleResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        Ok(response.data)
    }

    /// The next stream that is still on.
    pub fn next_stream(schedule: &Schedule) -> Result<FetchResult, FetchError> {
        let segment = schedule
            .segments
            .iter()
            .flatten()
            .find(|s| !s.is_canceled())
            .ok_or_else(|| {
                FetchError::NotFound(format!("no upcoming streams for {}", schedule.broadcaster_login))
            })?;
        let timestamp = parse_time(&segment.start_time)?;

        let mut payload = BTreeMap::new();
        payload.insert("title".to_string(), segment.title.clone());
        payload.insert(
            "category".to_string(),
            segment.category.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
        );
        payload.insert("start".to_string(), discord_time(timestamp));
        payload.insert("start_time".to_string(), segment.start_time.clone());

        Ok(FetchResult {
            timestamp,
            fingerprint: segment.id.clone(),
            display_name: schedule.broadcaster_name.clone(),
            url: format!("https://www.twitch.tv/{}", schedule.broadcaster_login),
            payload,
        })
    }
}

fn discord_time(ts: DateTime<Utc>) -> String {
    format!("<t:{}:f>", ts.timestamp())
}

/// Schedule listing, cancelled entries struck through.
pub fn format_schedule(segments: &[Segment]) -> String {
    let mut message = String::from("The next scheduled Twitch streams:");
    for segment in segments {
        let start = parse_time(&segment.start_time)
            .map(discord_time)
            .unwrap_or_else(|_| segment.start_time.clone());
        let mut line = format!("{} - {}", start, segment.title);
        if let Some(category) = &segment.category {
            line = format!("{} - {}", line, category.name);
        }
        if segment.is_canceled() {
            line = format!("~~{}~~ CANCELED", line);
        }
        message.push('\n');
        message.push_str(&line);
    }
    message
}

#[async_trait]
impl Fetcher for TwitchFetcher {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Twitch
    }

    async fn fetch(
        &self,
        credentials: &Credentials,
        subscription: &Subscription,
    ) -> Result<FetchResult, FetchError> {
        let schedule = self
            .schedule(credentials, &subscription.external_id, POLL_SEGMENTS)
            .await?;
        Self::next_stream(&schedule)
    }

    fn default_message(&self, fetch: &FetchResult) -> String {
        let mut line = format!(
            "**{}** scheduled a stream for {}: **{}**",
            fetch.display_name,
            fetch.field("start").unwrap_or_default(),
            fetch.field("title").unwrap_or_default()
        );
        if let Some(category) = fetch.field("category").filter(|c| !c.is_empty()) {
            line.push_str(&format!(" ({})", category));
        }
        format!("{}\n<{}>", line, fetch.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> serde_json::Value {
        json!({
            "data": {
                "broadcaster_id": "141981764",
                "broadcaster_name": "TwitchDev",
                "broadcaster_login": "twitchdev",
                "segments": [
                    {
                        "id": "seg-1",
                        "start_time": "2024-07-01T18:00:00Z",
                        "end_time": "2024-07-01T19:00:00Z",
                        "title": "Cancelled stream",
                        "canceled_until": "2024-07-01T19:00:00Z",
                        "category": { "id": "509670", "name": "Science & Technology" },
                        "is_recurring": false
                    },
                    {
                        "id": "seg-2",
                        "start_time": "2024-07-02T18:00:00Z",
                        "end_time": "2024-07-02T19:00:00Z",
                        "title": "TwitchDev Monthly Update",
                        "canceled_until": null,
                        "category": null,
                        "is_recurring": false
                    }
                ],
                "vacation": null
            }
        })
    }

    #[test]
    fn next_stream_skips_cancelled_segments() {
        let schedule = TwitchFetcher::parse_schedule(body()).unwrap();
        let next = TwitchFetcher::next_stream(&schedule).unwrap();
        assert_eq!(next.fingerprint, "seg-2");
        assert_eq!(next.display_name, "TwitchDev");
        assert_eq!(next.url, "https://www.twitch.tv/twitchdev");
        assert_eq!(next.field("start"), Some("<t:1719943200:f>"));
    }

    #[test]
    fn schedule_without_segments_is_not_found() {
        let schedule = TwitchFetcher::parse_schedule(json!({
            "data": { "broadcaster_name": "a", "broadcaster_login": "a", "segments": null }
        }))
        .unwrap();
        assert!(matches!(
            TwitchFetcher::next_stream(&schedule),
            Err(FetchError::NotFound(_))
        ));
    }

    #[test]
    fn formatted_schedule_strikes_cancelled() {
        let schedule = TwitchFetcher::parse_schedule(body()).unwrap();
        let text = format_schedule(schedule.segments.as_deref().unwrap_or_default());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "The next scheduled Twitch streams:");
        assert_eq!(
            lines[1],
            "~~<t:1719856800:f> - Cancelled stream - Science & Technology~~ CANCELED"
        );
        assert_eq!(lines[2], "<t:1719943200:f> - TwitchDev Monthly Update");
    }
}
