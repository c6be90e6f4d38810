use crate::commands::{say_private, tracker};
use crate::poller::TrackerKind;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

const KIND: TrackerKind = TrackerKind::YouTube;

/// Announce new YouTube uploads
#[poise::command(
    slash_command,
    subcommands(
        "setapikey",
        "subscribe",
        "unsubscribe",
        "customize",
        "rolemention",
        "list",
        "update",
        "demo",
        "setinterval",
        "setcache"
    ),
    required_permissions = "MANAGE_GUILD",
    guild_only
)]
pub async fn tube(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set this server's YouTube Data API key
#[poise::command(slash_command)]
pub async fn setapikey(
    ctx: Context<'_>,
    #[description = "YouTube Data API v3 key"] api_key: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    ctx.data()
        .tracking
        .set_api_key(KIND, Some(guild_id.get()), api_key.trim().to_string())
        .await?;
    info!("YouTube API key updated for guild {}", guild_id);
    say_private(ctx, "✅ YouTube API key saved for this server.").await
}

/// Announce a channel's uploads
#[poise::command(slash_command)]
pub async fn subscribe(
    ctx: Context<'_>,
    #[description = "YouTube channel id (UC...)"] channel_id: String,
    #[description = "Channel to post uploads in (default: this one)"]
    #[channel_types("Text", "News")]
    channel: Option<serenity::GuildChannel>,
    #[description = "Publish announcements to channel followers"] publish: Option<bool>,
) -> Result<(), Error> {
    tracker::subscribe(ctx, KIND, channel_id, channel, publish).await
}

/// Stop announcing a channel's uploads
#[poise::command(slash_command)]
pub async fn unsubscribe(
    ctx: Context<'_>,
    #[description = "YouTube channel id"] channel_id: String,
    #[description = "Only stop posting in this channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    tracker::unsubscribe(ctx, KIND, channel_id, channel).await
}

/// Set or clear the upload message (tokens: %name% %title% %url% %description%)
#[poise::command(slash_command)]
pub async fn customize(
    ctx: Context<'_>,
    #[description = "YouTube channel id"] channel_id: String,
    #[description = "Message template, empty to restore the default"] message: Option<String>,
) -> Result<(), Error> {
    tracker::customize(ctx, KIND, channel_id, message).await
}

/// Set or clear the role mentioned on uploads
#[poise::command(slash_command)]
pub async fn rolemention(
    ctx: Context<'_>,
    #[description = "YouTube channel id"] channel_id: String,
    #[description = "Role to mention, empty to mention nobody"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    tracker::role_mention(ctx, KIND, channel_id, role).await
}

/// List YouTube subscriptions
#[poise::command(slash_command)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    tracker::list(ctx, KIND).await
}

/// Check for new uploads now
#[poise::command(slash_command)]
pub async fn update(ctx: Context<'_>) -> Result<(), Error> {
    tracker::run_now(ctx, KIND, false).await
}

/// Post the latest upload of every subscription without recording it
#[poise::command(slash_command)]
pub async fn demo(ctx: Context<'_>) -> Result<(), Error> {
    tracker::run_now(ctx, KIND, true).await
}

/// Change how often YouTube is checked (Owner only)
#[poise::command(slash_command, owners_only, hide_in_help)]
pub async fn setinterval(
    ctx: Context<'_>,
    #[description = "Interval (e.g., 5m, 1h)"] interval: String,
) -> Result<(), Error> {
    tracker::set_interval(ctx, KIND, interval).await
}

/// Set how many announced videos are remembered per server (Owner only)
#[poise::command(slash_command, owners_only, hide_in_help)]
pub async fn setcache(
    ctx: Context<'_>,
    #[description = "Videos to remember"]
    #[min = 1]
    #[max = 10000]
    size: usize,
) -> Result<(), Error> {
    ctx.data().tracking.set_history_limit(KIND, size).await?;
    ctx.say(format!("✅ Remembering the last **{}** announced videos per server.", size))
        .await?;
    Ok(())
}
