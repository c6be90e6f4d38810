use crate::poller::fetch::FetchResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Delivery destination as it was known when the subscription was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: u64,
    pub name: String,
}

impl ChannelRef {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MentionTarget {
    Role(u64),
    Everyone,
}

impl MentionTarget {
    /// Discord gives the @everyone role the guild's own id.
    pub fn for_role(guild_id: u64, role_id: u64) -> Self {
        if role_id == guild_id {
            MentionTarget::Everyone
        } else {
            MentionTarget::Role(role_id)
        }
    }

    pub fn markup(&self) -> String {
        match self {
            MentionTarget::Role(id) => format!("<@&{id}>"),
            MentionTarget::Everyone => "@everyone".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub external_id: String,
    pub channel: ChannelRef,
    pub unique_key: String,
    /// Upstream locator resolved from `external_id` (e.g. an uploads playlist).
    #[serde(default)]
    pub upstream_ref: Option<String>,
    #[serde(default)]
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_fingerprint: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub custom_template: Option<String>,
    #[serde(default)]
    pub mention: Option<MentionTarget>,
    /// Crosspost after delivery (announcement channels only).
    #[serde(default)]
    pub publish: bool,
}

impl Subscription {
    pub fn new(external_id: impl Into<String>, channel: ChannelRef) -> Self {
        let external_id = external_id.into();
        let unique_key = unique_key(&external_id, channel.id);
        Self {
            external_id,
            channel,
            unique_key,
            upstream_ref: None,
            last_seen_timestamp: None,
            last_seen_fingerprint: None,
            display_name: None,
            custom_template: None,
            mention: None,
            publish: false,
        }
    }

    /// Record `fetch` as the last announced version. The timestamp never moves backwards.
    pub fn mark_seen(&mut self, fetch: &FetchResult) {
        self.last_seen_timestamp = match self.last_seen_timestamp {
            Some(previous) if previous > fetch.timestamp => Some(previous),
            _ => Some(fetch.timestamp),
        };
        self.last_seen_fingerprint = Some(fetch.fingerprint.clone());
        self.display_name = Some(fetch.display_name.clone());
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.external_id)
    }
}

/// One external resource may be bound to a given channel only once.
pub fn unique_key(external_id: &str, channel_id: u64) -> String {
    let canonical = format!("{external_id}:{channel_id}");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
