use crate::commands::{say_private, tracker};
use crate::poller::TrackerKind;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

const KIND: TrackerKind = TrackerKind::CurseForge;

/// Track CurseForge mod updates
#[poise::command(
    slash_command,
    subcommands(
        "setapikey",
        "track",
        "remove",
        "customize",
        "rolemention",
        "list",
        "update",
        "demo",
        "setinterval"
    ),
    required_permissions = "MANAGE_GUILD",
    guild_only
)]
pub async fn cfmod(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set the CurseForge API key (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn setapikey(
    ctx: Context<'_>,
    #[description = "CurseForge API key"] api_key: String,
) -> Result<(), Error> {
    ctx.data()
        .tracking
        .set_api_key(KIND, None, api_key.trim().to_string())
        .await?;
    info!("CurseForge API key updated by {}", ctx.author().name);
    say_private(ctx, "✅ CurseForge API key saved.").await
}

/// Track a mod's new files in a channel
#[poise::command(slash_command)]
pub async fn track(
    ctx: Context<'_>,
    #[description = "CurseForge project id"] mod_id: String,
    #[description = "Channel to post updates in (default: this one)"]
    #[channel_types("Text", "News")]
    channel: Option<serenity::GuildChannel>,
    #[description = "Publish updates to channel followers"] publish: Option<bool>,
) -> Result<(), Error> {
    tracker::subscribe(ctx, KIND, mod_id, channel, publish).await
}

/// Stop tracking a mod
#[poise::command(slash_command)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "CurseForge project id"] mod_id: String,
    #[description = "Only stop posting in this channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    tracker::unsubscribe(ctx, KIND, mod_id, channel).await
}

/// Set or clear the update message (tokens: %name% %url% %file% %summary%)
#[poise::command(slash_command)]
pub async fn customize(
    ctx: Context<'_>,
    #[description = "CurseForge project id"] mod_id: String,
    #[description = "Message template, empty to restore the default"] message: Option<String>,
) -> Result<(), Error> {
    tracker::customize(ctx, KIND, mod_id, message).await
}

/// Set or clear the role mentioned on updates
#[poise::command(slash_command)]
pub async fn rolemention(
    ctx: Context<'_>,
    #[description = "CurseForge project id"] mod_id: String,
    #[description = "Role to mention, empty to mention nobody"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    tracker::role_mention(ctx, KIND, mod_id, role).await
}

/// List tracked mods
#[poise::command(slash_command)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    tracker::list(ctx, KIND).await
}

/// Check tracked mods now
#[poise::command(slash_command)]
pub async fn update(ctx: Context<'_>) -> Result<(), Error> {
    tracker::run_now(ctx, KIND, false).await
}

/// Post the latest file of every tracked mod without recording it
#[poise::command(slash_command)]
pub async fn demo(ctx: Context<'_>) -> Result<(), Error> {
    tracker::run_now(ctx, KIND, true).await
}

/// Change how often CurseForge is checked (Owner only)
#[poise::command(slash_command, owners_only, hide_in_help)]
pub async fn setinterval(
    ctx: Context<'_>,
    #[description = "Interval (e.g., 5m, 1h)"] interval: String,
) -> Result<(), Error> {
    tracker::set_interval(ctx, KIND, interval).await
}
