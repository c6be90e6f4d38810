//! Gateway events routed into role reconciliation.

use crate::discord::{fetch_all_members, forum_thread_owners, member_snapshot};
use crate::roles::export::ExportFlips;
use crate::roles::MemberSnapshot;
use crate::{Data, Error};
use poise::serenity_prelude as serenity;
use tracing::{debug, warn};

pub async fn handle_event(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    let result = match event {
        serenity::FullEvent::GuildMemberUpdate {
            old_if_available,
            event,
            ..
        } => {
            if event.user.bot {
                return Ok(());
            }
            let after = MemberSnapshot::new(
                event.user.id.get(),
                event
                    .nick
                    .clone()
                    .or_else(|| event.user.global_name.clone())
                    .unwrap_or_else(|| event.user.name.clone()),
                event.roles.iter().map(|r| r.get()),
            );
            member_updated(
                data,
                event.guild_id.get(),
                old_if_available.as_ref().map(member_snapshot),
                after,
            )
            .await
        }
        serenity::FullEvent::GuildMemberRemoval {
            guild_id,
            user,
            member_data_if_available,
        } => {
            if user.bot {
                return Ok(());
            }
            member_left(
                data,
                guild_id.get(),
                user.id.get(),
                member_data_if_available.as_ref().map(member_snapshot),
            )
            .await
        }
        serenity::FullEvent::ThreadCreate { thread } => match (thread.parent_id, thread.owner_id) {
            (Some(forum), Some(owner)) => data
                .adforum
                .thread_created(
                    thread.guild_id.get(),
                    forum.get(),
                    owner.get(),
                    data.roles.as_ref(),
                )
                .await
                .map(|_| ()),
            _ => Ok(()),
        },
        serenity::FullEvent::ThreadDelete { thread, .. } => {
            // The owner may have other threads, so converge the whole forum
            resync_forum(data, thread.guild_id.get(), thread.parent_id.get())
                .await
                .map(|_| ())
        }
        _ => Ok(()),
    };

    if let Err(e) = result {
        warn!("Event {} failed: {}", event.snake_case_name(), e);
    }
    Ok(())
}

async fn member_updated(
    data: &Data,
    guild_id: u64,
    before: Option<MemberSnapshot>,
    after: MemberSnapshot,
) -> anyhow::Result<()> {
    data.linked_roles
        .process_member(guild_id, &after, data.roles.as_ref())
        .await?;

    let flips = match &before {
        Some(before) => data.exports.flips(guild_id, before, &after).await?,
        // Uncached member: the previous roles are unknown
        None => ExportFlips {
            whitelist: true,
            names: true,
        },
    };
    refresh_exports(data, guild_id, flips).await
}

async fn member_left(
    data: &Data,
    guild_id: u64,
    user_id: u64,
    member: Option<MemberSnapshot>,
) -> anyhow::Result<()> {
    data.linked_roles.member_left(guild_id, user_id).await?;
    let flips = match &member {
        Some(member) => data.exports.departure(guild_id, member).await?,
        None => ExportFlips {
            whitelist: true,
            names: true,
        },
    };
    refresh_exports(data, guild_id, flips).await
}

/// Rewrite the exports whose membership changed.
pub async fn refresh_exports(data: &Data, guild_id: u64, flips: ExportFlips) -> anyhow::Result<()> {
    if flips == ExportFlips::default() {
        return Ok(());
    }
    let whitelist_file = data.exports.whitelist_state(guild_id).await?.file.is_some();
    let names_file = data.exports.name_state(guild_id).await?.file.is_some();
    if !(flips.whitelist && whitelist_file) && !(flips.names && names_file) {
        return Ok(());
    }

    debug!("Refreshing exports for guild {}: {:?}", guild_id, flips);
    let members = fetch_all_members(&data.http, guild_id).await?;
    if flips.whitelist {
        data.exports.export_whitelist(guild_id, &members).await?;
    }
    if flips.names {
        data.exports.export_names(guild_id, &members).await?;
    }
    Ok(())
}

/// Converge an AdForum role onto its forum's thread owners. `None` if the forum is untracked.
pub async fn resync_forum(data: &Data, guild_id: u64, forum_id: u64) -> anyhow::Result<Option<usize>> {
    if data.adforum.role_for(guild_id, forum_id).await?.is_none() {
        return Ok(None);
    }
    let owners = forum_thread_owners(&data.http, guild_id, forum_id).await?;
    let members = fetch_all_members(&data.http, guild_id).await?;
    data.adforum
        .sync(guild_id, forum_id, &owners, &members, data.roles.as_ref())
        .await
}
