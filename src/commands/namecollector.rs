use crate::discord::{fetch_all_members, EMBED_COLOR};
use crate::roles::export::check_writable;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use std::path::PathBuf;

/// Export the names of members with a role
#[poise::command(
    slash_command,
    subcommands("info", "setrole", "sync", "setfile"),
    required_permissions = "ADMINISTRATOR",
    guild_only
)]
pub async fn rolenamecollector(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show the collector configuration
#[poise::command(slash_command)]
pub async fn info(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let state = ctx.data().exports.name_state(guild_id.get()).await?;
    let embed = serenity::CreateEmbed::new()
        .title("📝 Role Name Collector")
        .field(
            "Role",
            state
                .role
                .map(|r| format!("<@&{}>", r))
                .unwrap_or_else(|| "Not set".to_string()),
            true,
        )
        .field(
            "File",
            state
                .file
                .as_ref()
                .map(|p| format!("`{}`", p.display()))
                .unwrap_or_else(|| "Not set".to_string()),
            true,
        )
        .color(EMBED_COLOR);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Collect names of members with this role (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn setrole(
    ctx: Context<'_>,
    #[description = "Role to collect"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let id = role.id.get();
    ctx.data()
        .exports
        .update_names(guild_id, move |s| s.role = Some(id))
        .await?;
    write(ctx, &format!("Collecting names of **{}**.", role.name)).await
}

/// Rewrite the name file now (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn sync(ctx: Context<'_>) -> Result<(), Error> {
    write(ctx, "The name list was synced.").await
}

/// Set the file names are written to (Owner only)
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
        .update_names(guild_id, move |s| s.file = Some(file))
        .await?;
    write(ctx, &format!("Name file set to `{}`.", path.display())).await
}

async fn write(ctx: Context<'_>, message: &str) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    ctx.defer().await?;
    let data = ctx.data();
    let members = fetch_all_members(&data.http, guild_id).await?;
    let reply = match data.exports.export_names(guild_id, &members).await? {
        Some(count) => format!("✅ {} {} names exported.", message, count),
        None => format!("✅ {} Set both a role and a file to export names.", message),
    };
    ctx.say(reply).await?;
    Ok(())
}
