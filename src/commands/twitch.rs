use crate::commands::{say_private, tracker};
use crate::poller::store::CredentialSource;
use crate::poller::TrackerKind;
use crate::trackers::twitch::format_schedule;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

const KIND: TrackerKind = TrackerKind::Twitch;
const SCHEDULE_SEGMENTS: u32 = 5;

/// Announce upcoming Twitch streams
#[poise::command(
    slash_command,
    subcommands(
        "setcredentials",
        "schedule",
        "follow",
        "unfollow",
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
pub async fn twitch(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set the Twitch application client id and OAuth token (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn setcredentials(
    ctx: Context<'_>,
    #[description = "Twitch application client id"] client_id: String,
    #[description = "App access token"] token: String,
) -> Result<(), Error> {
    ctx.data()
        .tracking
        .set_twitch_credentials(client_id.trim().to_string(), token.trim().to_string())
        .await?;
    info!("Twitch credentials updated by {}", ctx.author().name);
    say_private(ctx, "✅ Twitch credentials saved.").await
}

/// Show the next scheduled streams
#[poise::command(slash_command)]
pub async fn schedule(
    ctx: Context<'_>,
    #[description = "Broadcaster id (default: the first one followed here)"]
    broadcaster_id: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let data = ctx.data();
    let broadcaster_id = match broadcaster_id.map(|id| id.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        _ => {
            let subs = data.twitch.poller.subscriptions(guild_id.get()).await?;
            let Some(first) = subs.into_iter().next() else {
                ctx.say("📭 No broadcaster is followed in this server. Pass a broadcaster id.")
                    .await?;
                return Ok(());
            };
            first.external_id
        }
    };
    let Some(credentials) = data.tracking.credentials(KIND, guild_id.get()).await? else {
        ctx.say("❌ Twitch credentials are not configured. Ask the bot owner to set them.")
            .await?;
        return Ok(());
    };

    ctx.defer().await?;
    match data
        .twitch_api
        .schedule(&credentials, &broadcaster_id, SCHEDULE_SEGMENTS)
        .await
    {
        Ok(schedule) => {
            let segments = schedule.segments.unwrap_or_default();
            if segments.is_empty() {
                ctx.say(format!("📭 {} has no scheduled streams.", schedule.broadcaster_name))
                    .await?;
            } else {
                ctx.say(format_schedule(&segments)).await?;
            }
        }
        Err(e) => {
            ctx.say(format!("❌ Could not load the schedule: {}", e)).await?;
        }
    }
    Ok(())
}

/// Announce a broadcaster's next scheduled stream
#[poise::command(slash_command)]
pub async fn follow(
    ctx: Context<'_>,
    #[description = "Twitch broadcaster id"] broadcaster_id: String,
    #[description = "Channel to post in (default: this one)"]
    #[channel_types("Text", "News")]
    channel: Option<serenity::GuildChannel>,
    #[description = "Publish announcements to channel followers"] publish: Option<bool>,
) -> Result<(), Error> {
    tracker::subscribe(ctx, KIND, broadcaster_id, channel, publish).await
}

/// Stop announcing a broadcaster
#[poise::command(slash_command)]
pub async fn unfollow(
    ctx: Context<'_>,
    #[description = "Twitch broadcaster id"] broadcaster_id: String,
    #[description = "Only stop posting in this channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    tracker::unsubscribe(ctx, KIND, broadcaster_id, channel).await
}

/// Set or clear the stream message (tokens: %name% %title% %category% %start% %url%)
#[poise::command(slash_command)]
pub async fn customize(
    ctx: Context<'_>,
    #[description = "Twitch broadcaster id"] broadcaster_id: String,
    #[description = "Message template, empty to restore the default"] message: Option<String>,
) -> Result<(), Error> {
    tracker::customize(ctx, KIND, broadcaster_id, message).await
}

/// Set or clear the role mentioned on announcements
#[poise::command(slash_command)]
pub async fn rolemention(
    ctx: Context<'_>,
    #[description = "Twitch broadcaster id"] broadcaster_id: String,
    #[description = "Role to mention, empty to mention nobody"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    tracker::role_mention(ctx, KIND, broadcaster_id, role).await
}

/// List followed broadcasters
#[poise::command(slash_command)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    tracker::list(ctx, KIND).await
}

/// Check schedules now
#[poise::command(slash_command)]
pub async fn update(ctx: Context<'_>) -> Result<(), Error> {
    tracker::run_now(ctx, KIND, false).await
}

/// Post the next stream of every followed broadcaster without recording it
#[poise::command(slash_command)]
pub async fn demo(ctx: Context<'_>) -> Result<(), Error> {
    tracker::run_now(ctx, KIND, true).await
}

/// Change how often Twitch is checked (Owner only)
#[poise::command(slash_command, owners_only, hide_in_help)]
pub async fn setinterval(
    ctx: Context<'_>,
    #[description = "Interval (e.g., 5m, 1h)"] interval: String,
) -> Result<(), Error> {
    tracker::set_interval(ctx, KIND, interval).await
}
