use crate::poller::fetch::FetchResult;
use crate::poller::store::history_entry;
use crate::poller::subscription::Subscription;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A genuinely new version
    Notify,
    /// Forced by demo mode; markers stay untouched
    Preview,
    Unchanged,
    /// New by marker, but this item was already announced into the channel
    AlreadyAnnounced,
}

impl Verdict {
    pub fn delivers(self) -> bool {
        matches!(self, Verdict::Notify | Verdict::Preview)
    }
}

/// Both the timestamp must advance and the fingerprint must differ.
pub fn should_notify(subscription: &Subscription, fetch: &FetchResult) -> bool {
    let last_seen = subscription
        .last_seen_timestamp
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let fingerprint_changed =
        subscription.last_seen_fingerprint.as_deref() != Some(fetch.fingerprint.as_str());
    fetch.timestamp > last_seen && fingerprint_changed
}

pub fn evaluate(
    subscription: &Subscription,
    fetch: &FetchResult,
    history: &HashSet<String>,
    demo: bool,
) -> Verdict {
    if demo {
        return Verdict::Preview;
    }
    if !should_notify(subscription, fetch) {
        return Verdict::Unchanged;
    }
    if history.contains(&history_entry(subscription.channel.id, &fetch.fingerprint)) {
        return Verdict::AlreadyAnnounced;
    }
    Verdict::Notify
}
