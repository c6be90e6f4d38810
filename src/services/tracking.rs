use crate::config::{Config, MIN_POLL_INTERVAL_SECS};
use crate::db::{guild_scope, Database, Versioned, GLOBAL_SCOPE};
use crate::poller::fetch::Credentials;
use crate::poller::store::{CredentialSource, SubscriptionStore, TrackerState};
use crate::poller::TrackerKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Runtime settings for one tracker, stored per scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Versioned for TrackerSettings {
    const VERSION: u32 = 1;
}

fn settings_key(kind: TrackerKind) -> String {
    format!("settings:{}", kind.key())
}

fn state_key(kind: TrackerKind) -> String {
    format!("tracker:{}", kind.key())
}

/// Database-backed tracker state and settings, falling back to env defaults.
#[derive(Clone)]
pub struct TrackingStore {
    db: Database,
    config: Arc<Config>,
}

impl TrackingStore {
    pub fn new(db: Database, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    pub async fn settings(&self, kind: TrackerKind, scope: String) -> anyhow::Result<TrackerSettings> {
        let key = settings_key(kind);
        self.db
            .run_blocking(move |db| db.load_versioned(&scope, &key))
            .await
    }

    async fn update_settings(
        &self,
        kind: TrackerKind,
        scope: String,
        apply: impl FnOnce(&mut TrackerSettings) + Send + 'static,
    ) -> anyhow::Result<()> {
        let key = settings_key(kind);
        self.db
            .run_blocking(move |db| {
                let mut settings: TrackerSettings = db.load_versioned(&scope, &key)?;
                apply(&mut settings);
                db.save_versioned(&scope, &key, &settings)
            })
            .await
    }

    /// YouTube keys are stored per guild; the others are global.
    pub async fn set_api_key(
        &self,
        kind: TrackerKind,
        guild_id: Option<u64>,
        api_key: String,
    ) -> anyhow::Result<()> {
        let scope = match (kind, guild_id) {
            (TrackerKind::YouTube, Some(guild_id)) => guild_scope(guild_id),
            _ => GLOBAL_SCOPE.to_string(),
        };
        self.update_settings(kind, scope, move |s| s.api_key = Some(api_key))
            .await
    }

    pub async fn set_twitch_credentials(
        &self,
        client_id: String,
        oauth_token: String,
    ) -> anyhow::Result<()> {
        self.update_settings(TrackerKind::Twitch, GLOBAL_SCOPE.to_string(), move |s| {
            s.client_id = Some(client_id);
            s.api_key = Some(oauth_token);
        })
        .await
    }

    /// Persist the poll interval, clamped to the floor. Returns the stored value.
    pub async fn set_poll_interval(&self, kind: TrackerKind, period: Duration) -> anyhow::Result<Duration> {
        let secs = period.as_secs().max(MIN_POLL_INTERVAL_SECS);
        self.update_settings(kind, GLOBAL_SCOPE.to_string(), move |s| {
            s.interval_secs = Some(secs)
        })
        .await?;
        Ok(Duration::from_secs(secs))
    }

    pub async fn poll_interval(&self, kind: TrackerKind) -> anyhow::Result<Duration> {
        let settings = self.settings(kind, GLOBAL_SCOPE.to_string()).await?;
        let secs = settings
            .interval_secs
            .unwrap_or(self.config.poll_interval_secs)
            .max(MIN_POLL_INTERVAL_SECS);
        Ok(Duration::from_secs(secs))
    }

    pub async fn set_history_limit(&self, kind: TrackerKind, limit: usize) -> anyhow::Result<()> {
        self.update_settings(kind, GLOBAL_SCOPE.to_string(), move |s| {
            s.history_limit = Some(limit)
        })
        .await
    }
}

#[async_trait]
impl SubscriptionStore for TrackingStore {
    async fn guild_ids(&self, kind: TrackerKind) -> anyhow::Result<Vec<u64>> {
        let key = state_key(kind);
        let scopes = self
            .db
            .run_blocking(move |db| db.scopes_with_key(&key))
            .await?;
        Ok(scopes.iter().filter_map(|s| s.parse().ok()).collect())
    }

    async fn load(&self, kind: TrackerKind, guild_id: u64) -> anyhow::Result<TrackerState> {
        let key = state_key(kind);
        self.db
            .run_blocking(move |db| db.load_versioned(&guild_scope(guild_id), &key))
            .await
    }

    async fn replace(
        &self,
        kind: TrackerKind,
        guild_id: u64,
        state: TrackerState,
    ) -> anyhow::Result<()> {
        let key = state_key(kind);
        self.db
            .run_blocking(move |db| db.save_versioned(&guild_scope(guild_id), &key, &state))
            .await
    }
}

#[async_trait]
impl CredentialSource for TrackingStore {
    async fn credentials(
        &self,
        kind: TrackerKind,
        guild_id: u64,
    ) -> anyhow::Result<Option<Credentials>> {
        let global = self.settings(kind, GLOBAL_SCOPE.to_string()).await?;
        let credentials = match kind {
            TrackerKind::CurseForge => global
                .api_key
                .or_else(|| self.config.curseforge_api_key.clone())
                .map(Credentials::api_key),
            TrackerKind::YouTube => self
                .settings(kind, guild_scope(guild_id))
                .await?
                .api_key
                .or(global.api_key)
                .map(Credentials::api_key),
            TrackerKind::Twitch => {
                let client_id = global
                    .client_id
                    .or_else(|| self.config.twitch_client_id.clone());
                let token = global
                    .api_key
                    .or_else(|| self.config.twitch_oauth_token.clone());
                match (client_id, token) {
                    (Some(client_id), Some(token)) => Some(Credentials {
                        token,
                        client_id: Some(client_id),
                    }),
                    _ => None,
                }
            }
        };
        Ok(credentials)
    }

    async fn history_limit(&self, kind: TrackerKind) -> anyhow::Result<usize> {
        let settings = self.settings(kind, GLOBAL_SCOPE.to_string()).await?;
        Ok(settings
            .history_limit
            .unwrap_or(self.config.history_cache_size))
    }
}
