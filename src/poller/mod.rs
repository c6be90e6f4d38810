//! Subscription poller shared by the content trackers.
//!
//! A tick walks every guild that has tracker state, fetches each external
//! resource once, announces new versions, and persists each guild's state in a
//! single write. Command handlers go through the same [`SubscriptionPoller`],
//! which serialises them with running cycles.

pub mod cycle;
pub mod detect;
pub mod fetch;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod subscription;

use cycle::{CycleOptions, CycleReport, PollCycle, Suppressions, TickCache};
use fetch::{Credentials, Fetcher};
use notify::Delivery;
use std::sync::Arc;
use store::{CredentialSource, SubscriptionError, SubscriptionStore, TrackerState};
use subscription::{ChannelRef, MentionTarget, Subscription};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerKind {
    CurseForge,
    YouTube,
    Twitch,
}

impl TrackerKind {
    pub const ALL: [TrackerKind; 3] = [
        TrackerKind::CurseForge,
        TrackerKind::YouTube,
        TrackerKind::Twitch,
    ];

    /// Storage key and log prefix.
    pub fn key(self) -> &'static str {
        match self {
            TrackerKind::CurseForge => "cfmod",
            TrackerKind::YouTube => "tube",
            TrackerKind::Twitch => "twitch",
        }
    }
}

impl std::fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TrackerKind::CurseForge => "CurseForge",
            TrackerKind::YouTube => "YouTube",
            TrackerKind::Twitch => "Twitch",
        };
        f.write_str(label)
    }
}

const CREDENTIALS_REASON: &str = "credentials";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub guilds: usize,
    pub skipped_guilds: usize,
    pub fetches: usize,
    pub delivered: usize,
    pub persisted: usize,
}

pub struct SubscriptionPoller {
    fetcher: Arc<dyn Fetcher>,
    delivery: Arc<dyn Delivery>,
    store: Arc<dyn SubscriptionStore>,
    settings: Arc<dyn CredentialSource>,
    // Held for the whole of every cycle and every mutation
    cycle_lock: Mutex<()>,
    suppressions: Mutex<Suppressions>,
}

impl SubscriptionPoller {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        delivery: Arc<dyn Delivery>,
        store: Arc<dyn SubscriptionStore>,
        settings: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            fetcher,
            delivery,
            store,
            settings,
            cycle_lock: Mutex::new(()),
            suppressions: Mutex::new(Suppressions::default()),
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.fetcher.kind()
    }

    async fn require_credentials(&self, guild_id: u64) -> Result<Credentials, SubscriptionError> {
        self.settings
            .credentials(self.kind(), guild_id)
            .await?
            .ok_or(SubscriptionError::MissingCredentials(self.kind()))
    }

    /// Bind `external_id` to `channel`, seeding the markers from one fetch.
    pub async fn subscribe(
        &self,
        guild_id: u64,
        external_id: &str,
        channel: ChannelRef,
        publish: bool,
    ) -> Result<Subscription, SubscriptionError> {
        let credentials = self.require_credentials(guild_id).await?;
        let _guard = self.cycle_lock.lock().await;

        let mut state = self.store.load(self.kind(), guild_id).await?;
        let mut sub = Subscription::new(external_id.trim(), channel);
        sub.publish = publish;
        if state.subscriptions.iter().any(|s| s.unique_key == sub.unique_key) {
            return Err(SubscriptionError::Duplicate);
        }

        self.fetcher.prepare(&credentials, &mut sub).await?;
        let latest = self.fetcher.fetch(&credentials, &sub).await?;
        sub.mark_seen(&latest);

        state.add(sub.clone())?;
        self.store.replace(self.kind(), guild_id, state).await?;
        info!(
            "{}: guild {} subscribed channel {} to {}",
            self.kind(),
            guild_id,
            sub.channel.id,
            sub.external_id
        );
        Ok(sub)
    }

    pub async fn unsubscribe(
        &self,
        guild_id: u64,
        external_id: &str,
        channel_id: Option<u64>,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        self.mutate(guild_id, |state| state.remove(external_id, channel_id))
            .await
    }

    pub async fn customize(
        &self,
        guild_id: u64,
        external_id: &str,
        template: Option<String>,
    ) -> Result<usize, SubscriptionError> {
        self.mutate(guild_id, |state| state.customize(external_id, template))
            .await
    }

    pub async fn set_mention(
        &self,
        guild_id: u64,
        external_id: &str,
        mention: Option<MentionTarget>,
    ) -> Result<usize, SubscriptionError> {
        self.mutate(guild_id, |state| state.set_mention(external_id, mention))
            .await
    }

    async fn mutate<T>(
        &self,
        guild_id: u64,
        apply: impl FnOnce(&mut TrackerState) -> Result<T, SubscriptionError> + Send,
    ) -> Result<T, SubscriptionError> {
        let _guard = self.cycle_lock.lock().await;
        let mut state = self.store.load(self.kind(), guild_id).await?;
        let out = apply(&mut state)?;
        self.store.replace(self.kind(), guild_id, state).await?;
        Ok(out)
    }

    pub async fn subscriptions(&self, guild_id: u64) -> anyhow::Result<Vec<Subscription>> {
        Ok(self.store.load(self.kind(), guild_id).await?.subscriptions)
    }

    /// Run one cycle for a single guild right now.
    pub async fn run_guild(
        &self,
        guild_id: u64,
        demo: bool,
    ) -> Result<CycleReport, SubscriptionError> {
        let credentials = self.require_credentials(guild_id).await?;
        let history_limit = self.settings.history_limit(self.kind()).await?;
        let _guard = self.cycle_lock.lock().await;
        let mut suppressions = self.suppressions.lock().await;
        let cancel = CancellationToken::new();
        let cycle = self.cycle(&cancel);
        let report = cycle
            .run(
                guild_id,
                &credentials,
                &mut TickCache::new(),
                &mut suppressions,
                CycleOptions {
                    demo,
                    history_limit,
                },
            )
            .await?;
        Ok(report)
    }

    /// Run one cycle for every guild with tracker state.
    pub async fn run_tick(&self, cancel: &CancellationToken) -> anyhow::Result<TickReport> {
        let kind = self.kind();
        let history_limit = self.settings.history_limit(kind).await?;
        let _guard = self.cycle_lock.lock().await;
        let mut suppressions = self.suppressions.lock().await;
        let mut cache = TickCache::new();
        let mut report = TickReport::default();
        let cycle = self.cycle(cancel);

        for guild_id in self.store.guild_ids(kind).await? {
            if cancel.is_cancelled() {
                break;
            }
            let credentials = match self.settings.credentials(kind, guild_id).await {
                Ok(Some(credentials)) => {
                    suppressions.clear(guild_id, CREDENTIALS_REASON);
                    credentials
                }
                Ok(None) => {
                    if suppressions.first(guild_id, CREDENTIALS_REASON) {
                        warn!(
                            "{}: credentials not configured for guild {}, skipping",
                            kind, guild_id
                        );
                    }
                    report.skipped_guilds += 1;
                    continue;
                }
                Err(e) => {
                    error!("{}: failed to load credentials for guild {}: {}", kind, guild_id, e);
                    report.skipped_guilds += 1;
                    continue;
                }
            };

            let options = CycleOptions {
                demo: false,
                history_limit,
            };
            match cycle
                .run(guild_id, &credentials, &mut cache, &mut suppressions, options)
                .await
            {
                Ok(cycle_report) => {
                    report.guilds += 1;
                    report.delivered += cycle_report.delivered;
                    if cycle_report.persisted {
                        report.persisted += 1;
                    }
                }
                Err(e) => error!("{}: cycle failed for guild {}: {}", kind, guild_id, e),
            }
        }

        report.fetches = cache.fetches();
        Ok(report)
    }

    /// Resolve missing upstream locators for stored subscriptions.
    pub async fn prepare_all(&self) -> anyhow::Result<usize> {
        let kind = self.kind();
        let _guard = self.cycle_lock.lock().await;
        let mut updated = 0;

        for guild_id in self.store.guild_ids(kind).await? {
            let Some(credentials) = self.settings.credentials(kind, guild_id).await? else {
                continue;
            };
            let mut state = self.store.load(kind, guild_id).await?;
            let mut changed = false;
            for sub in state.subscriptions.iter_mut() {
                match self.fetcher.prepare(&credentials, sub).await {
                    Ok(true) => {
                        changed = true;
                        updated += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        "{}: could not prepare {} in guild {}: {}",
                        kind, sub.external_id, guild_id, e
                    ),
                }
            }
            if changed {
                self.store.replace(kind, guild_id, state).await?;
            }
        }

        Ok(updated)
    }

    fn cycle<'a>(&'a self, cancel: &'a CancellationToken) -> PollCycle<'a> {
        PollCycle {
            fetcher: self.fetcher.as_ref(),
            delivery: self.delivery.as_ref(),
            store: self.store.as_ref(),
            cancel,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::poller::cycle::tests::{at, seeded, FakeDelivery, FakeFetcher, MemoryStore};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    pub(crate) struct FakeSettings {
        pub unconfigured: std::sync::Mutex<HashSet<u64>>,
        pub keys: std::sync::Mutex<HashMap<u64, String>>,
    }

    #[async_trait]
    impl CredentialSource for FakeSettings {
        async fn credentials(
            &self,
            _kind: TrackerKind,
            guild_id: u64,
        ) -> anyhow::Result<Option<Credentials>> {
            if self.unconfigured.lock().unwrap().contains(&guild_id) {
                return Ok(None);
            }
            let key = self
                .keys
                .lock()
                .unwrap()
                .get(&guild_id)
                .cloned()
                .unwrap_or_else(|| "key".to_string());
            Ok(Some(Credentials::api_key(key)))
        }

        async fn history_limit(&self, _kind: TrackerKind) -> anyhow::Result<usize> {
            Ok(500)
        }
    }

    pub(crate) fn poller_with(
        fetcher: Arc<FakeFetcher>,
        delivery: Arc<FakeDelivery>,
        store: Arc<MemoryStore>,
        settings: Arc<FakeSettings>,
    ) -> SubscriptionPoller {
        SubscriptionPoller::new(fetcher, delivery, store, settings)
    }

    #[tokio::test]
    async fn subscribe_seeds_markers_and_rejects_duplicates() {
        let fetcher = Arc::new(FakeFetcher::new());
        let store = Arc::new(MemoryStore::default());
        let poller = poller_with(
            fetcher.clone(),
            Arc::new(FakeDelivery::default()),
            store.clone(),
            Arc::new(FakeSettings::default()),
        );
        fetcher.publish("m", at(2020, 1), "A");

        let sub = poller
            .subscribe(1, "m", ChannelRef::new(10, "news"), false)
            .await
            .unwrap();
        assert_eq!(sub.last_seen_timestamp, Some(at(2020, 1)));
        assert_eq!(sub.last_seen_fingerprint.as_deref(), Some("A"));

        let before = store.state(1);
        let err = poller
            .subscribe(1, "m", ChannelRef::new(10, "news"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Duplicate));
        assert_eq!(store.state(1), before);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_without_credentials_fails() {
        let settings = Arc::new(FakeSettings::default());
        settings.unconfigured.lock().unwrap().insert(1);
        let poller = poller_with(
            Arc::new(FakeFetcher::new()),
            Arc::new(FakeDelivery::default()),
            Arc::new(MemoryStore::default()),
            settings,
        );

        let err = poller
            .subscribe(1, "m", ChannelRef::new(10, "news"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::MissingCredentials(TrackerKind::CurseForge)
        ));
    }

    #[tokio::test]
    async fn tick_fetches_each_external_id_once_across_guilds() {
        let fetcher = Arc::new(FakeFetcher::new());
        let delivery = Arc::new(FakeDelivery::default());
        let store = Arc::new(MemoryStore::default());
        let settings = Arc::new(FakeSettings::default());
        for guild in [1, 2] {
            store.put(
                guild,
                TrackerState {
                    subscriptions: vec![seeded("m", guild * 10, at(2020, 1), "A")],
                    history: vec![],
                },
            );
        }
        fetcher.publish("m", at(2020, 2), "B");

        let poller = poller_with(fetcher.clone(), delivery.clone(), store.clone(), settings);
        let report = poller.run_tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.guilds, 2);
        assert_eq!(report.fetches, 1);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.persisted, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_key_in_one_guild_does_not_skip_another() {
        let fetcher = Arc::new(FakeFetcher::new());
        let delivery = Arc::new(FakeDelivery::default());
        let store = Arc::new(MemoryStore::default());
        let settings = Arc::new(FakeSettings::default());
        for guild in [1, 2] {
            store.put(
                guild,
                TrackerState {
                    subscriptions: vec![seeded("UCsame", guild * 10, at(2020, 1), "A")],
                    history: vec![],
                },
            );
        }
        {
            let mut keys = settings.keys.lock().unwrap();
            keys.insert(1, "revoked".to_string());
            keys.insert(2, "valid".to_string());
        }
        fetcher.revoked.lock().unwrap().insert("revoked".to_string());
        fetcher.publish("UCsame", at(2020, 2), "B");

        let poller = poller_with(fetcher.clone(), delivery.clone(), store.clone(), settings);
        let report = poller.run_tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.guilds, 2);
        assert_eq!(report.fetches, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(delivery.sent.lock().unwrap()[0].0, 20);
        assert_eq!(
            store.state(1).subscriptions[0].last_seen_fingerprint.as_deref(),
            Some("A")
        );
        assert_eq!(
            store.state(2).subscriptions[0].last_seen_fingerprint.as_deref(),
            Some("B")
        );
    }

    #[tokio::test]
    async fn unconfigured_guild_is_skipped_and_warned_once() {
        let fetcher = Arc::new(FakeFetcher::new());
        let store = Arc::new(MemoryStore::default());
        let settings = Arc::new(FakeSettings::default());
        settings.unconfigured.lock().unwrap().insert(1);
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 1), "A")],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let poller = poller_with(
            fetcher.clone(),
            Arc::new(FakeDelivery::default()),
            store,
            settings.clone(),
        );
        let cancel = CancellationToken::new();
        let report = poller.run_tick(&cancel).await.unwrap();
        assert_eq!(report.skipped_guilds, 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        // Suppressed on the second tick, cleared once configured
        poller.run_tick(&cancel).await.unwrap();
        assert!(!poller.suppressions.lock().await.first(1, CREDENTIALS_REASON));
        settings.unconfigured.lock().unwrap().clear();
        let report = poller.run_tick(&cancel).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(poller.suppressions.lock().await.first(1, CREDENTIALS_REASON));
    }

    #[tokio::test]
    async fn mutations_round_trip_through_store() {
        let fetcher = Arc::new(FakeFetcher::new());
        let store = Arc::new(MemoryStore::default());
        let poller = poller_with(
            fetcher.clone(),
            Arc::new(FakeDelivery::default()),
            store.clone(),
            Arc::new(FakeSettings::default()),
        );
        fetcher.publish("m", at(2020, 1), "A");
        poller
            .subscribe(1, "m", ChannelRef::new(10, "news"), false)
            .await
            .unwrap();

        poller
            .customize(1, "m", Some("New: %name%".to_string()))
            .await
            .unwrap();
        poller
            .set_mention(1, "m", Some(MentionTarget::Everyone))
            .await
            .unwrap();
        let subs = poller.subscriptions(1).await.unwrap();
        assert_eq!(subs[0].custom_template.as_deref(), Some("New: %name%"));
        assert_eq!(subs[0].mention, Some(MentionTarget::Everyone));

        let removed = poller.unsubscribe(1, "m", None).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(poller.subscriptions(1).await.unwrap().is_empty());
        assert!(matches!(
            poller.unsubscribe(1, "m", None).await,
            Err(SubscriptionError::NotFound)
        ));
    }
}
