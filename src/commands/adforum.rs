use crate::events::resync_forum;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

/// Give thread owners in a forum a role
#[poise::command(
    slash_command,
    subcommands("setup", "delete", "sync"),
    required_permissions = "MANAGE_ROLES",
    guild_only
)]
pub async fn adforum(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Grant a role to everyone with a thread in a forum
#[poise::command(slash_command)]
pub async fn setup(
    ctx: Context<'_>,
    #[description = "Forum channel"]
    #[channel_types("Forum")]
    forum: serenity::GuildChannel,
    #[description = "Role for thread owners"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let data = ctx.data();
    if !data.adforum.setup(guild_id, forum.id.get(), role.id.get()).await? {
        ctx.say("❌ That forum is already set up.").await?;
        return Ok(());
    }
    ctx.defer().await?;
    info!("AdForum: forum {} set up with role {} in guild {}", forum.id, role.id, guild_id);
    let changes = resync_forum(data, guild_id, forum.id.get()).await?.unwrap_or(0);
    ctx.say(format!(
        "✅ <#{}> is set up and synced ({} role changes).",
        forum.id, changes
    ))
    .await?;
    Ok(())
}

/// Stop managing a forum's role
#[poise::command(slash_command)]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Forum channel"]
    #[channel_types("Forum")]
    forum: serenity::GuildChannel,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    if ctx.data().adforum.delete(guild_id, forum.id.get()).await? {
        ctx.say("✅ The forum config was deleted.").await?;
    } else {
        ctx.say("❌ That forum is not set up.").await?;
    }
    Ok(())
}

/// Re-check who owns threads in a forum
#[poise::command(slash_command)]
pub async fn sync(
    ctx: Context<'_>,
    #[description = "Forum channel"]
    #[channel_types("Forum")]
    forum: serenity::GuildChannel,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    ctx.defer().await?;
    match resync_forum(ctx.data(), guild_id, forum.id.get()).await? {
        Some(changes) => {
            ctx.say(format!("✅ The forum was synced ({} role changes).", changes))
                .await?
        }
        None => ctx.say("❌ That forum is not set up.").await?,
    };
    Ok(())
}
