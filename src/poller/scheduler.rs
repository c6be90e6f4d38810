use crate::poller::SubscriptionPoller;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Background loop driving one tracker's poller.
pub struct PollScheduler {
    poller: Arc<SubscriptionPoller>,
    interval: watch::Receiver<Duration>,
    // Keeps the channel open while the loop runs
    _interval_tx: Arc<watch::Sender<Duration>>,
    cancel: CancellationToken,
}

/// Control side of a running [`PollScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    interval_tx: Arc<watch::Sender<Duration>>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Takes effect immediately; the next tick is one full period away.
    pub fn set_interval(&self, period: Duration) {
        self.interval_tx.send_replace(period);
    }

    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// A tracker's poller paired with the handle of its scheduler.
#[derive(Clone)]
pub struct TrackerHandle {
    pub poller: Arc<SubscriptionPoller>,
    pub scheduler: SchedulerHandle,
}

impl PollScheduler {
    pub fn new(
        poller: Arc<SubscriptionPoller>,
        period: Duration,
        cancel: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = watch::channel(period);
        let tx = Arc::new(tx);
        let handle = SchedulerHandle {
            interval_tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let scheduler = Self {
            poller,
            interval: rx,
            _interval_tx: tx,
            cancel,
        };
        (scheduler, handle)
    }

    pub async fn run(mut self) {
        let kind = self.poller.kind();
        let period = *self.interval.borrow_and_update();
        info!("{}: poller started, every {:?}", kind, period);

        match self.poller.prepare_all().await {
            Ok(0) => {}
            Ok(n) => info!("{}: resolved upstream locators for {} subscriptions", kind, n),
            Err(e) => warn!("{}: failed to prepare subscriptions: {}", kind, e),
        }

        let mut ticker = Self::ticker(Duration::ZERO, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.interval.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let period = *self.interval.borrow_and_update();
                    info!("{}: poll interval changed to {:?}", kind, period);
                    ticker = Self::ticker(period, period);
                }
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("{}: poller stopped", kind);
    }

    fn ticker(first_in: Duration, period: Duration) -> Interval {
        let mut ticker = interval_at(Instant::now() + first_in, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn tick(&self) {
        let kind = self.poller.kind();
        match self.poller.run_tick(&self.cancel).await {
            Ok(report) if report.delivered > 0 || report.persisted > 0 => info!(
                "{}: tick done, {} guilds, {} fetches, {} notifications",
                kind, report.guilds, report.fetches, report.delivered
            ),
            Ok(report) => debug!(
                "{}: tick done, {} guilds, {} fetches, nothing new",
                kind, report.guilds, report.fetches
            ),
            Err(e) => error!("{}: poll tick failed: {}", kind, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::cycle::tests::{at, seeded, FakeDelivery, FakeFetcher, MemoryStore};
    use crate::poller::store::TrackerState;
    use crate::poller::tests::{poller_with, FakeSettings};
    use std::sync::atomic::Ordering;

    fn scheduled(fetcher: Arc<FakeFetcher>, period: Duration) -> (PollScheduler, SchedulerHandle) {
        let store = Arc::new(MemoryStore::default());
        store.put(
            1,
            TrackerState {
                subscriptions: vec![seeded("m", 10, at(2020, 1), "A")],
                history: vec![],
            },
        );
        fetcher.publish("m", at(2020, 1), "A");
        let poller = poller_with(
            fetcher,
            Arc::new(FakeDelivery::default()),
            store,
            Arc::new(FakeSettings::default()),
        );
        PollScheduler::new(Arc::new(poller), period, CancellationToken::new())
    }

    #[tokio::test]
    async fn first_tick_runs_immediately_and_shutdown_stops_loop() {
        let fetcher = Arc::new(FakeFetcher::new());
        let (scheduler, handle) = scheduled(fetcher.clone(), Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        handle.shutdown();
        assert!(!handle.is_running());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn interval_change_applies_to_running_loop() {
        let fetcher = Arc::new(FakeFetcher::new());
        let (scheduler, handle) = scheduled(fetcher.clone(), Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.set_interval(Duration::from_millis(20));
        assert_eq!(handle.interval(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 3);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
