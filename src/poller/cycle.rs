use crate::poller::detect::{self, Verdict};
use crate::poller::fetch::{Credentials, FetchError, FetchResult, Fetcher};
use crate::poller::notify::{self, Delivery};
use crate::poller::store::{history_entry, SubscriptionStore};
use crate::poller::subscription::Subscription;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fetch outcomes for one scheduler tick, shared by every guild processed in it.
///
/// Successes are reused by any guild. A failure is only reused by guilds
/// presenting the same credentials, since another guild's key may work.
#[derive(Default)]
pub struct TickCache {
    results: HashMap<String, FetchResult>,
    failures: HashMap<(String, String), FetchError>,
    fetches: usize,
}

impl TickCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream calls made so far.
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    pub async fn get_or_fetch(
        &mut self,
        fetcher: &dyn Fetcher,
        credentials: &Credentials,
        subscription: &Subscription,
    ) -> Result<FetchResult, FetchError> {
        if let Some(hit) = self.results.get(&subscription.external_id) {
            return Ok(hit.clone());
        }
        let failure_key = (subscription.external_id.clone(), credentials.token.clone());
        if let Some(err) = self.failures.get(&failure_key) {
            return Err(err.clone());
        }
        let result = fetcher.fetch(credentials, subscription).await;
        self.fetches += 1;
        match &result {
            Ok(fetch) => {
                self.results
                    .insert(subscription.external_id.clone(), fetch.clone());
            }
            Err(err) => {
                self.failures.insert(failure_key, err.clone());
            }
        }
        result
    }
}

/// Warnings already emitted, keyed by guild and reason. Lives across ticks.
#[derive(Debug, Default)]
pub struct Suppressions {
    seen: HashSet<(u64, String)>,
}

impl Suppressions {
    /// True the first time a (guild, reason) pair is reported.
    pub fn first(&mut self, guild_id: u64, reason: impl Into<String>) -> bool {
        self.seen.insert((guild_id, reason.into()))
    }

    pub fn clear(&mut self, guild_id: u64, reason: &str) {
        self.seen.remove(&(guild_id, reason.to_string()));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOptions {
    pub demo: bool,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub groups: usize,
    pub fetch_failures: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
    pub persisted: bool,
}

pub struct PollCycle<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub delivery: &'a dyn Delivery,
    pub store: &'a dyn SubscriptionStore,
    pub cancel: &'a CancellationToken,
}

impl PollCycle<'_> {
    /// One pass over a guild's subscriptions: group, fetch, detect, notify, persist once.
    pub async fn run(
        &self,
        guild_id: u64,
        credentials: &Credentials,
        cache: &mut TickCache,
        suppressions: &mut Suppressions,
        options: CycleOptions,
    ) -> anyhow::Result<CycleReport> {
        let kind = self.fetcher.kind();
        let mut state = self.store.load(kind, guild_id).await?;
        let history: HashSet<String> = state.history.iter().cloned().collect();
        let mut announced = Vec::new();
        let mut altered = false;
        let mut report = CycleReport::default();

        for (external_id, members) in state.groups() {
            report.groups += 1;
            let probe = state.subscriptions[members[0]].clone();
            let fetch_reason = format!("fetch:{external_id}");
            let fetch = match cache.get_or_fetch(self.fetcher, credentials, &probe).await {
                Ok(fetch) => {
                    suppressions.clear(guild_id, &fetch_reason);
                    fetch
                }
                Err(e) => {
                    report.fetch_failures += 1;
                    if suppressions.first(guild_id, fetch_reason) {
                        warn!(
                            "{}: failed to fetch {} for guild {}: {}",
                            kind, external_id, guild_id, e
                        );
                    } else {
                        debug!("{}: fetch for {} still failing: {}", kind, external_id, e);
                    }
                    continue;
                }
            };

            for index in members {
                let sub = &mut state.subscriptions[index];
                if !options.demo && sub.display_name.as_deref() != Some(fetch.display_name.as_str()) {
                    sub.display_name = Some(fetch.display_name.clone());
                    altered = true;
                }

                let verdict = detect::evaluate(sub, &fetch, &history, options.demo);
                if verdict == Verdict::AlreadyAnnounced {
                    sub.mark_seen(&fetch);
                    altered = true;
                    continue;
                }
                if !verdict.delivers() {
                    continue;
                }

                let message = notify::render(sub, &fetch, self.fetcher);
                let channel_reason = format!("channel:{}", sub.channel.id);
                match self.delivery.deliver(&sub.channel, &message).await {
                    Ok(()) => {
                        report.delivered += 1;
                        suppressions.clear(guild_id, &channel_reason);
                        if verdict == Verdict::Notify {
                            sub.mark_seen(&fetch);
                            announced.push(history_entry(sub.channel.id, &fetch.fingerprint));
                            altered = true;
                        }
                    }
                    Err(e) => {
                        report.delivery_failures += 1;
                        if suppressions.first(guild_id, channel_reason) {
                            warn!(
                                "{}: skipping {} in guild {}: {}",
                                kind, sub.external_id, guild_id, e
                            );
                        }
                    }
                }
            }
        }

        if options.demo {
            return Ok(report);
        }

        let history_before = state.history.len();
        state.remember(announced, options.history_limit);
        altered |= state.history.len() != history_before;

        if altered {
            if self.cancel.is_cancelled() {
                info!(
                    "{}: shutdown requested, dropping cycle results for guild {}",
                    kind, guild_id
                );
                return Ok(report);
            }
            self.store.replace(kind, guild_id, state).await?;
            report.persisted = true;
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::poller::notify::{DeliveryError, RenderedMessage};
    use crate::poller::store::TrackerState;
    use crate::poller::subscription::ChannelRef;
    use crate::poller::TrackerKind;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn at(y: i32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).unwrap()
    }

    pub(crate) struct FakeFetcher {
        pub latest: Mutex<HashMap<String, FetchResult>>,
        pub revoked: Mutex<HashSet<String>>,
        pub calls: AtomicUsize,
    }

    impl FakeFetcher {
        pub fn new() -> Self {
            Self {
                latest: Mutex::new(HashMap::new()),
                revoked: Mutex::new(HashSet::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn publish(&self, id: &str, ts: DateTime<Utc>, fingerprint: &str) {
            self.latest.lock().unwrap().insert(
                id.to_string(),
                FetchResult {
                    timestamp: ts,
                    fingerprint: fingerprint.to_string(),
                    display_name: format!("Mod {id}"),
                    url: format!("http://x/{id}"),
                    payload: BTreeMap::new(),
                },
            );
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        fn kind(&self) -> TrackerKind {
            TrackerKind::CurseForge
        }

        async fn fetch(
            &self,
            credentials: &Credentials,
            subscription: &Subscription,
        ) -> Result<FetchResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.revoked.lock().unwrap().contains(&credentials.token) {
                return Err(FetchError::Http("403 Forbidden".to_string()));
            }
            self.latest
                .lock()
                .unwrap()
                .get(&subscription.external_id)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(subscription.external_id.clone()))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDelivery {
        pub sent: Mutex<Vec<(u64, RenderedMessage)>>,
        pub dead_channels: Mutex<HashSet<u64>>,
    }

    #[async_trait]
    impl Delivery for FakeDelivery {
        async fn deliver(
            &self,
            channel: &ChannelRef,
            message: &RenderedMessage,
        ) -> Result<(), DeliveryError> {
            if self.dead_channels.lock().unwrap().contains(&channel.id) {
                return Err(DeliveryError::ChannelUnavailable(channel.id));
            }
            self.sent.lock().unwrap().push((channel.id, message.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub states: Mutex<HashMap<u64, TrackerState>>,
        pub writes: AtomicUsize,
    }

    impl MemoryStore {
        pub fn state(&self, guild_id: u64) -> TrackerState {
            self.states
                .lock()
                .unwrap()
                .get(&guild_id)
                .cloned()
                .unwrap_or_default()
        }

        pub fn put(&self, guild_id: u64, state: TrackerState) {
            self.states.lock().unwrap().insert(guild_id, state);
        }
    }

    #[async_trait]
    impl SubscriptionStore for MemoryStore {
        async fn guild_ids(&self, _kind: TrackerKind) -> anyhow::Result<Vec<u64>> {
            let mut ids: Vec<u64> = self.states.lock().unwrap().keys().copied().collect();
            ids.sort();
            Ok(ids)
        }

        async fn load(&self, _kind: TrackerKind, guild_id: u64) -> anyhow::Result<TrackerState> {
            Ok(self.state(guild_id))
        }

        async fn replace(
            &self,
            _kind: TrackerKind,
            guild_id: u64,
            state: TrackerState,
        ) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.put(guild_id, state);
            Ok(())
        }
    }

    pub(crate) fn seeded(id: &str, channel: u64, ts: DateTime<Utc>, fingerprint: &str) -> Subscription {
        let mut sub = Subscription::new(id, ChannelRef::new(channel, format!("c{channel}")));
        sub.last_seen_timestamp = Some(ts);
        sub.last_seen_fingerprint = Some(fingerprint.to_string());
        sub.display_name = Some(format!("Mod {id}"));
        sub
    }

    fn options() -> CycleOptions {
        CycleOptions {
            demo: false,
            history_limit: 500,
        }
    }

    fn credentials() -> Credentials {
        Credentials::api_key("key")
    }

    #[tokio::test]
    async fn new_version_is_delivered_and_marker_persisted() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 1), "A")],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let mut suppressions = Suppressions::default();
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut suppressions, options())
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(report.persisted);
        let state = store.state(1);
        assert_eq!(state.subscriptions[0].last_seen_timestamp, Some(at(2020, 2)));
        assert_eq!(state.subscriptions[0].last_seen_fingerprint.as_deref(), Some("B"));
        assert_eq!(state.history, vec![history_entry(10, "B")]);

        // Re-poll with no upstream change: nothing sent, nothing written
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut suppressions, options())
            .await
            .unwrap();
        assert_eq!(report.delivered, 0);
        assert!(!report.persisted);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shared_external_id_is_fetched_once() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![
                    seeded("m", 10, at(2020, 1), "A"),
                    seeded("m", 11, at(2020, 1), "A"),
                    seeded("m", 12, at(2020, 1), "A"),
                ],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let mut cache = TickCache::new();
        let report = cycle
            .run(1, &credentials(), &mut cache, &mut Suppressions::default(), options())
            .await
            .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetches(), 1);
        assert_eq!(report.groups, 1);
        assert_eq!(report.delivered, 3);
    }

    #[tokio::test]
    async fn unavailable_channel_does_not_stop_siblings() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        delivery.dead_channels.lock().unwrap().insert(10);
        store.put(
            1,
            TrackerState {
                subscriptions: vec![
                    seeded("m", 10, at(2020, 1), "A"),
                    seeded("m", 11, at(2020, 1), "A"),
                ],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let mut suppressions = Suppressions::default();
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut suppressions, options())
            .await
            .unwrap();

        assert_eq!(report.delivery_failures, 1);
        assert_eq!(report.delivered, 1);
        assert!(report.persisted);
        let state = store.state(1);
        // The failed binding keeps its old marker and retries next tick
        assert_eq!(state.subscriptions[0].last_seen_fingerprint.as_deref(), Some("A"));
        assert_eq!(state.subscriptions[1].last_seen_fingerprint.as_deref(), Some("B"));
        assert!(!suppressions.first(1, "channel:10"));
    }

    #[tokio::test]
    async fn fetch_failure_isolated_to_its_group() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![
                    seeded("missing", 10, at(2020, 1), "A"),
                    seeded("m", 10, at(2020, 1), "A"),
                ],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut Suppressions::default(), options())
            .await
            .unwrap();

        assert_eq!(report.fetch_failures, 1);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn demo_delivers_without_touching_markers() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 2), "B")],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let report = cycle
            .run(
                1,
                &credentials(),
                &mut TickCache::new(),
                &mut Suppressions::default(),
                CycleOptions {
                    demo: true,
                    history_limit: 500,
                },
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(!report.persisted);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_cycle_skips_persist() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 1), "A")],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");
        cancel.cancel();

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut Suppressions::default(), options())
            .await
            .unwrap();

        assert!(!report.persisted);
        assert_eq!(store.state(1).subscriptions[0].last_seen_fingerprint.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn history_blocks_reannouncing_same_item() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 1), "A")],
                history: vec![history_entry(10, "B")],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut Suppressions::default(), options())
            .await
            .unwrap();

        assert_eq!(report.delivered, 0);
        assert!(delivery.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn already_announced_item_advances_markers() {
        let fetcher = FakeFetcher::new();
        let delivery = FakeDelivery::default();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 1), "A")],
                history: vec![history_entry(10, "B")],
            },
        );
        fetcher.publish("m", at(2020, 2), "B");

        let cycle = PollCycle {
            fetcher: &fetcher,
            delivery: &delivery,
            store: &store,
            cancel: &cancel,
        };
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut Suppressions::default(), options())
            .await
            .unwrap();
        assert!(report.persisted);
        let sub = &store.state(1).subscriptions[0];
        assert_eq!(sub.last_seen_fingerprint.as_deref(), Some("B"));
        assert_eq!(sub.last_seen_timestamp, Some(at(2020, 2)));

        // Once the entry ages out of history the item must still stay quiet
        let tight = CycleOptions {
            demo: false,
            history_limit: 0,
        };
        let report = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut Suppressions::default(), tight)
            .await
            .unwrap();
        assert!(store.state(1).history.is_empty());
        let report_again = cycle
            .run(1, &credentials(), &mut TickCache::new(), &mut Suppressions::default(), tight)
            .await
            .unwrap();
        assert_eq!(report.delivered + report_again.delivered, 0);
        assert!(delivery.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cached_failure_only_applies_to_same_credentials() {
        let fetcher = FakeFetcher::new();
        fetcher.publish("m", at(2020, 2), "B");
        fetcher.revoked.lock().unwrap().insert("bad".to_string());
        let sub = seeded("m", 10, at(2020, 1), "A");
        let mut cache = TickCache::new();

        let bad = Credentials::api_key("bad");
        assert!(cache.get_or_fetch(&fetcher, &bad, &sub).await.is_err());
        assert!(cache.get_or_fetch(&fetcher, &bad, &sub).await.is_err());
        assert_eq!(cache.fetches(), 1);

        let good = Credentials::api_key("good");
        let fetch = cache.get_or_fetch(&fetcher, &good, &sub).await.unwrap();
        assert_eq!(fetch.fingerprint, "B");
        assert!(cache.get_or_fetch(&fetcher, &bad, &sub).await.is_ok());
        assert_eq!(cache.fetches(), 2);
    }
}
