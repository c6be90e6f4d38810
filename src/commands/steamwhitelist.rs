use crate::commands::say_private;
use crate::discord::{fetch_all_members, EMBED_COLOR};
use crate::roles::export::{check_writable, validate_steam_id};
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use std::path::PathBuf;
use tracing::{info, warn};

/// Rewrite this guild's whitelist file from the current membership.
async fn export(data: &Data, guild_id: u64) -> anyhow::Result<Option<usize>> {
    let members = fetch_all_members(&data.http, guild_id).await?;
    data.exports.export_whitelist(guild_id, &members).await
}

/// Re-export every whitelist the user is part of.
async fn export_for_user(data: &Data, user_id: u64) -> anyhow::Result<()> {
    for guild_id in data.exports.whitelist_guilds().await? {
        let is_member = data
            .http
            .get_member(serenity::GuildId::new(guild_id), serenity::UserId::new(user_id))
            .await
            .is_ok();
        if is_member {
            export(data, guild_id).await?;
        }
    }
    Ok(())
}

/// Manage your Steam ID for server whitelists
#[poise::command(slash_command, subcommands("set", "show", "clear"))]
pub async fn steamid(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Save your SteamID64
#[poise::command(slash_command)]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Your SteamID64 (76561...)"] steam_id: String,
) -> Result<(), Error> {
    let data = ctx.data();
    let user_id = ctx.author().id.get();
    match data.exports.set_steam_id(user_id, &steam_id).await? {
        Ok(_) => {
            say_private(ctx, "✅ Your Steam ID was saved.").await?;
            if let Err(e) = export_for_user(data, user_id).await {
                warn!("SteamWhitelist: re-export for user {} failed: {}", user_id, e);
            }
        }
        Err(e) => say_private(ctx, format!("❌ {}", e)).await?,
    }
    Ok(())
}

/// Show your saved SteamID64
#[poise::command(slash_command)]
pub async fn show(ctx: Context<'_>) -> Result<(), Error> {
    match ctx.data().exports.steam_id(ctx.author().id.get()).await? {
        Some(id) => say_private(ctx, format!("🎮 Your saved Steam ID is `{}`.", id)).await,
        None => say_private(ctx, "📭 You have not saved a Steam ID. Use `/steamid set`.").await,
    }
}

/// Delete your saved SteamID64
#[poise::command(slash_command)]
pub async fn clear(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let user_id = ctx.author().id.get();
    if !data.exports.forget_steam_id(user_id).await? {
        return say_private(ctx, "📭 You have no saved Steam ID.").await;
    }
    say_private(ctx, "✅ Your Steam ID was deleted.").await?;
    if let Err(e) = export_for_user(data, user_id).await {
        warn!("SteamWhitelist: re-export for user {} failed: {}", user_id, e);
    }
    Ok(())
}

/// Export Steam IDs of members with whitelisted roles
#[poise::command(
    slash_command,
    subcommands(
        "info",
        "addrole",
        "removerole",
        "add",
        "remove",
        "ban",
        "unban",
        "sync",
        "setfile"
    ),
    required_permissions = "ADMINISTRATOR",
    guild_only
)]
pub async fn steamwhitelist(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show the whitelist configuration
#[poise::command(slash_command)]
pub async fn info(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let state = ctx.data().exports.whitelist_state(guild_id.get()).await?;

    let roles = if state.roles.is_empty() {
        "None".to_string()
    } else {
        state
            .roles
            .iter()
            .map(|r| format!("<@&{}>", r))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let file = state
        .file
        .as_ref()
        .map(|p| format!("`{}`", p.display()))
        .unwrap_or_else(|| "Not set".to_string());

    let embed = serenity::CreateEmbed::new()
        .title("🎮 Steam Whitelist")
        .field("Roles", roles, false)
        .field("Permanent entries", state.whitelist.len().to_string(), true)
        .field("Bans", state.bans.len().to_string(), true)
        .field("File", file, false)
        .color(EMBED_COLOR);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Finish an admin change: re-export and report.
async fn changed(ctx: Context<'_>, message: &str) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    ctx.defer().await?;
    let reply = match export(ctx.data(), guild_id).await? {
        Some(count) => format!("✅ {} The whitelist now has {} entries.", message, count),
        None => format!("✅ {} Set a file with `/steamwhitelist setfile` to export it.", message),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Whitelist members with a role (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn addrole(
    ctx: Context<'_>,
    #[description = "Role to whitelist"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let id = role.id.get();
    if !ctx.data().exports.update_whitelist(guild_id, move |s| s.add_role(id)).await? {
        ctx.say("❌ That role is already whitelisted.").await?;
        return Ok(());
    }
    changed(ctx, &format!("Role **{}** was added to the whitelist.", role.name)).await
}

/// Stop whitelisting a role (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn removerole(
    ctx: Context<'_>,
    #[description = "Whitelisted role"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let id = role.id.get();
    if !ctx.data().exports.update_whitelist(guild_id, move |s| s.remove_role(id)).await? {
        ctx.say("❌ That role is not on the whitelist.").await?;
        return Ok(());
    }
    changed(ctx, &format!("Role **{}** was removed from the whitelist.", role.name)).await
}

/// Permanently whitelist a SteamID64
#[poise::command(slash_command)]
pub async fn add(
    ctx: Context<'_>,
    #[description = "SteamID64 (76561...)"] steam_id: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let steam_id = match validate_steam_id(&steam_id) {
        Ok(id) => id,
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
            return Ok(());
        }
    };
    if !ctx.data().exports.update_whitelist(guild_id, move |s| s.permit(steam_id)).await? {
        ctx.say("❌ That Steam ID is already whitelisted.").await?;
        return Ok(());
    }
    changed(ctx, "The Steam ID was added to the whitelist.").await
}

/// Remove a permanently whitelisted SteamID64
#[poise::command(slash_command)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "SteamID64"] steam_id: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let steam_id = steam_id.trim().to_string();
    if !ctx
        .data()
        .exports
        .update_whitelist(guild_id, move |s| s.revoke(&steam_id))
        .await?
    {
        ctx.say("❌ The Steam ID was not found.").await?;
        return Ok(());
    }
    changed(ctx, "The Steam ID was removed from the whitelist.").await
}

/// Keep a SteamID64 out of the whitelist
#[poise::command(slash_command)]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "SteamID64 (76561...)"] steam_id: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let steam_id = match validate_steam_id(&steam_id) {
        Ok(id) => id,
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
            return Ok(());
        }
    };
    if !ctx.data().exports.update_whitelist(guild_id, move |s| s.ban(steam_id)).await? {
        ctx.say("❌ That Steam ID is already banned.").await?;
        return Ok(());
    }
    info!("SteamWhitelist: ban added in guild {} by {}", guild_id, ctx.author().name);
    changed(ctx, "The Steam ID was added to the ban list.").await
}

/// Lift a ban
#[poise::command(slash_command)]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "SteamID64"] steam_id: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let steam_id = steam_id.trim().to_string();
    if !ctx
        .data()
        .exports
        .update_whitelist(guild_id, move |s| s.unban(&steam_id))
        .await?
    {
        ctx.say("❌ The Steam ID was not found.").await?;
        return Ok(());
    }
    changed(ctx, "The Steam ID was removed from the ban list.").await
}

/// Rewrite the whitelist file now (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn sync(ctx: Context<'_>) -> Result<(), Error> {
    changed(ctx, "The whitelist was synced.").await
}

/// Set the file the whitelist is written to (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn setfile(
    ctx: Context<'_>,
    #[description = "Path on the bot's host"] path: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let path = PathBuf::from(path.trim());
    if let Err(e) = check_writable(&path).await {
        ctx.say(format!("❌ `{}` is not writable: {}", path.display(), e))
            .await?;
        return Ok(());
    }
    let file = path.clone();
    ctx.data()
        .exports
        .update_whitelist(guild_id, move |s| s.file = Some(file))
        .await?;
    changed(ctx, &format!("Whitelist file set to `{}`.", path.display())).await
}
