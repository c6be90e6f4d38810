//! Command bodies shared by the CurseForge, YouTube and Twitch command groups.

use crate::discord::EMBED_COLOR;
use crate::poller::fetch::FetchError;
use crate::poller::store::SubscriptionError;
use crate::poller::subscription::{ChannelRef, MentionTarget, Subscription};
use crate::poller::TrackerKind;
use crate::{Context, Error};
use humantime::{format_duration, parse_duration};
use poise::serenity_prelude as serenity;
use tracing::info;

/// Discord allows 25 fields per embed; nine keeps each page readable
const SUBSCRIPTIONS_PER_PAGE: usize = 9;
const TEMPLATE_PREVIEW_CHARS: usize = 200;

/// Tell the user about a failed subscription operation.
/// Storage failures are returned as errors; everything else is answered in chat.
async fn answer_error(
    ctx: Context<'_>,
    kind: TrackerKind,
    external_id: &str,
    err: SubscriptionError,
) -> Result<(), Error> {
    let message = match err {
        SubscriptionError::Store(e) => return Err(e.into()),
        SubscriptionError::MissingCredentials(_) => format!(
            "❌ {} credentials are not configured. Ask the bot owner to set them.",
            kind
        ),
        SubscriptionError::Duplicate => {
            format!("❌ `{}` is already tracked in that channel.", external_id)
        }
        SubscriptionError::NotFound => {
            format!("❌ `{}` is not tracked in this server.", external_id)
        }
        SubscriptionError::Fetch(FetchError::NotFound(_)) => {
            format!("❌ {} has nothing for `{}`. Check the id.", kind, external_id)
        }
        SubscriptionError::Fetch(FetchError::RateLimited) => {
            format!("⏳ {} is rate limiting requests, try again later.", kind)
        }
        SubscriptionError::Fetch(e) => format!("❌ {} request failed: {}", kind, e),
    };
    ctx.say(message).await?;
    Ok(())
}

async fn channel_ref(ctx: Context<'_>, channel: Option<serenity::GuildChannel>) -> ChannelRef {
    match channel {
        Some(channel) => ChannelRef::new(channel.id.get(), channel.name),
        None => {
            let id = ctx.channel_id();
            let name = id.name(ctx).await.unwrap_or_else(|_| id.to_string());
            ChannelRef::new(id.get(), name)
        }
    }
}

pub async fn subscribe(
    ctx: Context<'_>,
    kind: TrackerKind,
    external_id: String,
    channel: Option<serenity::GuildChannel>,
    publish: Option<bool>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let external_id = external_id.trim().to_string();
    if external_id.is_empty() {
        ctx.say("❌ An id is required.").await?;
        return Ok(());
    }
    ctx.defer().await?;

    let channel = channel_ref(ctx, channel).await;
    let channel_id = channel.id;
    let poller = &ctx.data().tracker(kind).poller;
    match poller
        .subscribe(guild_id.get(), &external_id, channel, publish.unwrap_or(false))
        .await
    {
        Ok(sub) => {
            info!(
                "{}: {} subscribed {} to channel {} in guild {}",
                kind,
                ctx.author().name,
                external_id,
                channel_id,
                guild_id
            );
            ctx.say(format!(
                "✅ Now tracking **{}** in <#{}>.",
                sub.label(),
                channel_id
            ))
            .await?;
            Ok(())
        }
        Err(e) => answer_error(ctx, kind, &external_id, e).await,
    }
}

pub async fn unsubscribe(
    ctx: Context<'_>,
    kind: TrackerKind,
    external_id: String,
    channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let external_id = external_id.trim().to_string();
    let poller = &ctx.data().tracker(kind).poller;
    match poller
        .unsubscribe(guild_id.get(), &external_id, channel.map(|c| c.id.get()))
        .await
    {
        Ok(removed) => {
            let channels: Vec<String> = removed
                .iter()
                .map(|s| format!("<#{}>", s.channel.id))
                .collect();
            ctx.say(format!(
                "✅ Stopped tracking `{}` in {}.",
                external_id,
                channels.join(", ")
            ))
            .await?;
            Ok(())
        }
        Err(e) => answer_error(ctx, kind, &external_id, e).await,
    }
}

pub async fn customize(
    ctx: Context<'_>,
    kind: TrackerKind,
    external_id: String,
    template: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let external_id = external_id.trim().to_string();
    let template = template
        .map(|t| t.replace("\\n", "\n"))
        .filter(|t| !t.trim().is_empty());
    let cleared = template.is_none();
    let poller = &ctx.data().tracker(kind).poller;
    match poller.customize(guild_id.get(), &external_id, template).await {
        Ok(count) if cleared => {
            ctx.say(format!(
                "✅ Custom message removed from {} subscription(s) of `{}`.",
                count, external_id
            ))
            .await?;
            Ok(())
        }
        Ok(count) => {
            ctx.say(format!(
                "✅ Custom message set on {} subscription(s) of `{}`.",
                count, external_id
            ))
            .await?;
            Ok(())
        }
        Err(e) => answer_error(ctx, kind, &external_id, e).await,
    }
}

pub async fn role_mention(
    ctx: Context<'_>,
    kind: TrackerKind,
    external_id: String,
    role: Option<serenity::Role>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let external_id = external_id.trim().to_string();
    let mention = role.map(|r| MentionTarget::for_role(guild_id.get(), r.id.get()));
    let poller = &ctx.data().tracker(kind).poller;
    match poller.set_mention(guild_id.get(), &external_id, mention).await {
        Ok(_) => {
            let reply = match mention {
                Some(target) => format!(
                    "✅ Updates for `{}` will mention {}.",
                    external_id,
                    target.markup()
                ),
                None => format!("✅ Updates for `{}` will not mention anyone.", external_id),
            };
            ctx.send(
                poise::CreateReply::default()
                    .content(reply)
                    .allowed_mentions(serenity::CreateAllowedMentions::new()),
            )
            .await?;
            Ok(())
        }
        Err(e) => answer_error(ctx, kind, &external_id, e).await,
    }
}

fn describe(sub: &Subscription) -> String {
    let mut lines = vec![format!("Channel: <#{}> (`{}`)", sub.channel.id, sub.channel.name)];
    if sub.label() != sub.external_id {
        lines.push(format!("Id: `{}`", sub.external_id));
    }
    if let Some(mention) = &sub.mention {
        lines.push(format!("Mentions: {}", mention.markup()));
    }
    if sub.publish {
        lines.push("Published to followers".to_string());
    }
    if let Some(template) = &sub.custom_template {
        let mut preview: String = template.chars().take(TEMPLATE_PREVIEW_CHARS).collect();
        if template.chars().count() > TEMPLATE_PREVIEW_CHARS {
            preview.push_str("...");
        }
        lines.push(format!("Custom message: {}", preview));
    }
    lines.join("\n")
}

/// Subscriptions grouped by channel, one embed per page.
pub fn subscription_pages(kind: TrackerKind, subs: &[Subscription]) -> Vec<serenity::CreateEmbed> {
    let mut sorted: Vec<&Subscription> = subs.iter().collect();
    sorted.sort_by(|a, b| {
        (a.channel.name.as_str(), a.label()).cmp(&(b.channel.name.as_str(), b.label()))
    });
    let pages = sorted.len().div_ceil(SUBSCRIPTIONS_PER_PAGE);
    sorted
        .chunks(SUBSCRIPTIONS_PER_PAGE)
        .enumerate()
        .map(|(i, chunk)| {
            let mut embed = serenity::CreateEmbed::new()
                .title(format!("📋 {} subscriptions", kind))
                .color(EMBED_COLOR)
                .footer(serenity::CreateEmbedFooter::new(format!(
                    "Page {}/{}",
                    i + 1,
                    pages
                )));
            for sub in chunk {
                embed = embed.field(sub.label(), describe(sub), false);
            }
            embed
        })
        .collect()
}

pub async fn list(ctx: Context<'_>, kind: TrackerKind) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let subs = ctx
        .data()
        .tracker(kind)
        .poller
        .subscriptions(guild_id.get())
        .await?;
    if subs.is_empty() {
        ctx.say(format!("📭 Nothing is tracked on {} in this server.", kind))
            .await?;
        return Ok(());
    }
    for embed in subscription_pages(kind, &subs) {
        ctx.send(poise::CreateReply::default().embed(embed)).await?;
    }
    Ok(())
}

/// Run a cycle for this guild now. `demo` posts the latest item everywhere without recording it.
pub async fn run_now(ctx: Context<'_>, kind: TrackerKind, demo: bool) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    ctx.defer().await?;
    let poller = &ctx.data().tracker(kind).poller;
    match poller.run_guild(guild_id.get(), demo).await {
        Ok(report) => {
            let mut reply = format!(
                "✅ Checked {} item(s), {} notification(s) sent.",
                report.groups, report.delivered
            );
            if report.fetch_failures > 0 {
                reply.push_str(&format!(" {} item(s) could not be fetched.", report.fetch_failures));
            }
            if report.delivery_failures > 0 {
                reply.push_str(&format!(
                    " {} notification(s) could not be delivered.",
                    report.delivery_failures
                ));
            }
            ctx.say(reply).await?;
            Ok(())
        }
        Err(e) => answer_error(ctx, kind, "", e).await,
    }
}

pub async fn set_interval(ctx: Context<'_>, kind: TrackerKind, interval: String) -> Result<(), Error> {
    let period = match parse_duration(interval.trim()) {
        Ok(period) => period,
        Err(_) => {
            ctx.say("❌ Invalid duration. Examples: `5m`, `90s`, `1h`.").await?;
            return Ok(());
        }
    };
    let data = ctx.data();
    let stored = data.tracking.set_poll_interval(kind, period).await?;
    data.tracker(kind).scheduler.set_interval(stored);
    info!("{}: poll interval set to {:?} by {}", kind, stored, ctx.author().name);
    ctx.say(format!(
        "✅ {} is now checked every **{}**.",
        kind,
        format_duration(stored)
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: &str, channel: u64, channel_name: &str) -> Subscription {
        Subscription::new(id, ChannelRef::new(channel, channel_name))
    }

    #[test]
    fn pages_hold_nine_subscriptions() {
        let subs: Vec<Subscription> = (0..19)
            .map(|i| sub(&format!("mod{}", i), 1, "updates"))
            .collect();
        assert_eq!(subscription_pages(TrackerKind::CurseForge, &subs).len(), 3);
        assert_eq!(subscription_pages(TrackerKind::CurseForge, &subs[..9]).len(), 1);
        assert!(subscription_pages(TrackerKind::CurseForge, &[]).is_empty());
    }

    #[test]
    fn description_lists_optional_settings() {
        let mut s = sub("123", 42, "mods");
        s.display_name = Some("Cool Mod".to_string());
        s.mention = Some(MentionTarget::Role(7));
        s.custom_template = Some("x".repeat(300));

        let text = describe(&s);
        assert!(text.contains("<#42>"));
        assert!(text.contains("Id: `123`"));
        assert!(text.contains("<@&7>"));
        assert!(text.ends_with("..."));
        assert!(!text.contains("Published"));
    }
}
