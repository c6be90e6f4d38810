use crate::discord::{fetch_all_members, EMBED_COLOR};
use crate::roles::linked::LinkedRoleError;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;

/// Keep roles only while members hold one of their reference roles
#[poise::command(
    slash_command,
    subcommands("setup", "delete", "addrole", "removerole", "list", "updatemembers"),
    required_permissions = "MANAGE_ROLES",
    guild_only
)]
pub async fn linkedroles(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn edit(
    ctx: Context<'_>,
    edit: impl FnOnce(&mut crate::roles::linked::LinkedRoleState) -> Result<(), LinkedRoleError> + Send,
    done: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    match ctx.data().linked_roles.update(guild_id.get(), edit).await? {
        Ok(()) => ctx.say(format!("✅ {}", done)).await?,
        Err(e) => ctx.say(format!("❌ {}", e)).await?,
    };
    Ok(())
}

/// Set up a role as a linked role
#[poise::command(slash_command)]
pub async fn setup(
    ctx: Context<'_>,
    #[description = "Role to link"] role: serenity::Role,
) -> Result<(), Error> {
    let id = role.id.get();
    edit(
        ctx,
        move |s| s.setup(id),
        format!(
            "**{}** is now a linked role. Add reference roles with `/linkedroles addrole`.",
            role.name
        ),
    )
    .await
}

/// Stop linking a role
#[poise::command(slash_command)]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Linked role"] role: serenity::Role,
) -> Result<(), Error> {
    let id = role.id.get();
    edit(
        ctx,
        move |s| s.delete(id),
        format!("**{}** is no longer a linked role.", role.name),
    )
    .await
}

/// Add a reference role to a linked role
#[poise::command(slash_command)]
pub async fn addrole(
    ctx: Context<'_>,
    #[description = "Linked role"] linked_role: serenity::Role,
    #[description = "Role that keeps the linked role"] reference_role: serenity::Role,
) -> Result<(), Error> {
    let (linked, reference) = (linked_role.id.get(), reference_role.id.get());
    edit(
        ctx,
        move |s| s.add_reference(linked, reference),
        format!(
            "**{}** now keeps **{}**.",
            reference_role.name, linked_role.name
        ),
    )
    .await
}

/// Remove a reference role from a linked role
#[poise::command(slash_command)]
pub async fn removerole(
    ctx: Context<'_>,
    #[description = "Linked role"] linked_role: serenity::Role,
    #[description = "Reference role to remove"] reference_role: serenity::Role,
) -> Result<(), Error> {
    let (linked, reference) = (linked_role.id.get(), reference_role.id.get());
    edit(
        ctx,
        move |s| s.remove_reference(linked, reference),
        format!(
            "**{}** no longer keeps **{}**.",
            reference_role.name, linked_role.name
        ),
    )
    .await
}

/// Show linked roles and their reference roles
#[poise::command(slash_command)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let state = ctx.data().linked_roles.state(guild_id.get()).await?;
    if state.links.is_empty() {
        ctx.say("📭 No linked roles are set up.").await?;
        return Ok(());
    }

    let lines: Vec<String> = state
        .links
        .iter()
        .map(|(role_id, refs)| {
            let refs = if refs.is_empty() {
                "no reference roles yet".to_string()
            } else {
                refs.iter()
                    .map(|r| format!("<@&{}>", r))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!("<@&{}> kept by {}", role_id, refs)
        })
        .collect();
    let embed = serenity::CreateEmbed::new()
        .title("🔗 Linked Roles")
        .description(lines.join("\n"))
        .footer(serenity::CreateEmbedFooter::new(format!(
            "{} members with suspended roles",
            state.members_with_suspended_roles()
        )))
        .color(EMBED_COLOR);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Re-check every member of the server
#[poise::command(slash_command)]
pub async fn updatemembers(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    ctx.defer().await?;
    let data = ctx.data();
    let members = fetch_all_members(&data.http, guild_id.get()).await?;
    let suspended = data
        .linked_roles
        .resync(guild_id.get(), &members, data.roles.as_ref())
        .await?;
    ctx.say(format!(
        "✅ Checked {} members. {} members now have a saved role.",
        members.len(),
        suspended
    ))
    .await?;
    Ok(())
}
