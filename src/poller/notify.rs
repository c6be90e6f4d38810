use crate::config::{DISCORD_EMBED_LIMIT, DISCORD_MESSAGE_LIMIT};
use crate::poller::fetch::{FetchResult, Fetcher};
use crate::poller::subscription::{ChannelRef, MentionTarget, Subscription};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichCard {
    pub title: String,
    pub url: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub content: String,
    pub card: Option<RichCard>,
    /// Only this target may be pinged; `None` suppresses every mention.
    pub mention: Option<MentionTarget>,
    pub publish: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("channel {0} is unavailable")]
    ChannelUnavailable(u64),
    #[error("missing permission to post in channel {0}")]
    PermissionDenied(u64),
    #[error("delivery failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        channel: &ChannelRef,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError>;
}

pub fn render(
    subscription: &Subscription,
    fetch: &FetchResult,
    fetcher: &dyn Fetcher,
) -> RenderedMessage {
    let body = match subscription.custom_template.as_deref() {
        Some(template) if !template.trim().is_empty() => {
            let mut text = render_template(template, fetch);
            if fetcher.link_custom_messages() && !template.contains("%url%") {
                text.push('\n');
                text.push_str(&fetch.url);
            }
            text
        }
        _ => fetcher.default_message(fetch),
    };

    let content = match subscription.mention {
        Some(target) => format!("{} {}", target.markup(), body),
        None => body,
    };

    let card = fetch
        .payload
        .get("changelog")
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|changelog| RichCard {
            title: format!("{} changelog", fetch.display_name),
            url: Some(fetch.url.clone()),
            description: truncate_chars(changelog, DISCORD_EMBED_LIMIT),
        });

    RenderedMessage {
        content: truncate_chars(&content, DISCORD_MESSAGE_LIMIT),
        card,
        mention: subscription.mention,
        publish: subscription.publish,
    }
}

/// Replace `%key%` tokens with fetch fields. Unknown keys become empty.
pub fn render_template(template: &str, fetch: &FetchResult) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if is_token(&after[..end]) => {
                out.push_str(fetch.field(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_token(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
