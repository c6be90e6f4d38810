use crate::poller::fetch::{Credentials, FetchError, FetchResult, Fetcher};
use crate::poller::subscription::Subscription;
use crate::poller::TrackerKind;
use crate::trackers::{get_json, parse_time, unescape_html};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

const API_BASE: &str = "https://api.curseforge.com/v1";

#[derive(Debug, Deserialize)]
struct ModResponse {
    data: ModData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModData {
    id: u64,
    name: String,
    #[serde(default)]
    summary: String,
    links: ModLinks,
    #[serde(default)]
    latest_files: Vec<ModFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModLinks {
    #[serde(default)]
    website_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModFile {
    display_name: String,
    #[serde(default)]
    file_name: String,
    file_date: String,
    file_fingerprint: u64,
}

pub struct CurseForgeFetcher {
    client: reqwest::Client,
}

impl CurseForgeFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Turn a `/v1/mods/{id}` body into the newest file's version.
    pub fn parse_mod(body: serde_json::Value) -> Result<FetchResult, FetchError> {
        let response: ModResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        let data = response.data;

        let mut newest: Option<(chrono::DateTime<chrono::Utc>, &ModFile)> = None;
        for file in &data.latest_files {
            let date = parse_time(&file.file_date)?;
            if newest.map_or(true, |(best, _)| date > best) {
                newest = Some((date, file));
            }
        }
        let (timestamp, file) = newest
            .ok_or_else(|| FetchError::Malformed(format!("mod {} has no files", data.id)))?;

        let url = data
            .links
            .website_url
            .clone()
            .unwrap_or_else(|| format!("https://www.curseforge.com/projects/{}", data.id));
        let display_name = unescape_html(&data.name);

        let mut payload = BTreeMap::new();
        payload.insert("file".to_string(), file.display_name.clone());
        payload.insert("filename".to_string(), file.file_name.clone());
        payload.insert("summary".to_string(), data.summary.clone());

        Ok(FetchResult {
            timestamp,
            fingerprint: file.file_fingerprint.to_string(),
            display_name,
            url,
            payload,
        })
    }
}

#[async_trait]
impl Fetcher for CurseForgeFetcher {
    fn kind(&self) -> TrackerKind {
        TrackerKind::CurseForge
    }

    async fn fetch(
        &self,
        credentials: &Credentials,
        subscription: &Subscription,
    ) -> Result<FetchResult, FetchError> {
        let mod_id = subscription.external_id.trim();
        if mod_id.is_empty() || !mod_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(FetchError::NotFound(format!("mod {}", mod_id)));
        }
        let request = self
            .client
            .get(format!("{}/mods/{}", API_BASE, mod_id))
            .header("X-Api-Key", &credentials.token)
            .header("Accept", "application/json");
        let body = get_json(request, &format!("mod {}", mod_id)).await?;
        Self::parse_mod(body)
    }
}
