use crate::db::Versioned;
use crate::poller::fetch::{Credentials, FetchError};
use crate::poller::subscription::{MentionTarget, Subscription};
use crate::poller::TrackerKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("{0} credentials are not configured")]
    MissingCredentials(TrackerKind),
    #[error("this subscription already exists")]
    Duplicate,
    #[error("subscription not found")]
    NotFound,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Everything persisted for one tracker in one guild. Always written as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// `history_entry` values already announced in this guild, oldest first.
    #[serde(default)]
    pub history: Vec<String>,
}

impl Versioned for TrackerState {
    const VERSION: u32 = 2;

    // v1 stored the bare subscription list
    fn migrate(from_version: u32, body: Value) -> anyhow::Result<Value> {
        match (from_version, body) {
            (1, Value::Array(subscriptions)) => Ok(serde_json::json!({
                "subscriptions": subscriptions,
                "history": [],
            })),
            (1, other) => Err(anyhow::anyhow!(
                "unexpected v1 tracker state shape: {}",
                other
            )),
            (_, body) => Ok(body),
        }
    }
}

impl TrackerState {
    pub fn add(&mut self, subscription: Subscription) -> Result<(), SubscriptionError> {
        if self
            .subscriptions
            .iter()
            .any(|s| s.unique_key == subscription.unique_key)
        {
            return Err(SubscriptionError::Duplicate);
        }
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Remove the binding to `channel_id`, or every binding of `external_id` when `None`.
    pub fn remove(
        &mut self,
        external_id: &str,
        channel_id: Option<u64>,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.subscriptions)
                .into_iter()
                .partition(|s| {
                    s.external_id == external_id
                        && channel_id.map_or(true, |id| s.channel.id == id)
                });
        self.subscriptions = kept;
        if removed.is_empty() {
            return Err(SubscriptionError::NotFound);
        }
        Ok(removed)
    }

    pub fn customize(
        &mut self,
        external_id: &str,
        template: Option<String>,
    ) -> Result<usize, SubscriptionError> {
        self.update_matching(external_id, |s| s.custom_template = template.clone())
    }

    pub fn set_mention(
        &mut self,
        external_id: &str,
        mention: Option<MentionTarget>,
    ) -> Result<usize, SubscriptionError> {
        self.update_matching(external_id, |s| s.mention = mention)
    }

    fn update_matching(
        &mut self,
        external_id: &str,
        mut apply: impl FnMut(&mut Subscription),
    ) -> Result<usize, SubscriptionError> {
        let mut count = 0;
        for sub in self
            .subscriptions
            .iter_mut()
            .filter(|s| s.external_id == external_id)
        {
            apply(sub);
            count += 1;
        }
        if count == 0 {
            return Err(SubscriptionError::NotFound);
        }
        Ok(count)
    }

    /// Subscription indices grouped by external id, in first-seen order.
    pub fn groups(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, sub) in self.subscriptions.iter().enumerate() {
            match groups.iter_mut().find(|(id, _)| *id == sub.external_id) {
                Some((_, members)) => members.push(index),
                None => groups.push((sub.external_id.clone(), vec![index])),
            }
        }
        groups
    }

    /// Append newly announced fingerprints and keep only the newest `limit`.
    pub fn remember(&mut self, fingerprints: Vec<String>, limit: usize) {
        for fingerprint in fingerprints {
            if !self.history.contains(&fingerprint) {
                self.history.push(fingerprint);
            }
        }
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

/// History entry for an item announced into a channel.
pub fn history_entry(channel_id: u64, fingerprint: &str) -> String {
    format!("{channel_id}:{fingerprint}")
}

/// Persistence for tracker state. `replace` overwrites the whole guild record.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn guild_ids(&self, kind: TrackerKind) -> anyhow::Result<Vec<u64>>;
    async fn load(&self, kind: TrackerKind, guild_id: u64) -> anyhow::Result<TrackerState>;
    async fn replace(
        &self,
        kind: TrackerKind,
        guild_id: u64,
        state: TrackerState,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(
        &self,
        kind: TrackerKind,
        guild_id: u64,
    ) -> anyhow::Result<Option<Credentials>>;

    async fn history_limit(&self, kind: TrackerKind) -> anyhow::Result<usize>;
}
