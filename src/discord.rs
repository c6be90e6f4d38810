//! serenity adapters for the poller and role reconciliation boundaries.

use crate::poller::notify::{Delivery, DeliveryError, RenderedMessage};
use crate::poller::subscription::{ChannelRef, MentionTarget};
use crate::roles::{MemberSnapshot, RoleMutator};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, CreateAllowedMentions, CreateEmbed, CreateMessage, GuildId, Member, RoleId,
    UserId,
};
use serenity::http::{Http, HttpError};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Discord's page size for member listing
const MEMBER_PAGE: u64 = 1000;
/// Archived threads requested per page
const ARCHIVED_THREAD_PAGE: u64 = 100;

pub const EMBED_COLOR: u32 = 0x5865F2;

fn status_of(err: &serenity::Error) -> Option<u16> {
    match err {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
            Some(response.status_code.as_u16())
        }
        _ => None,
    }
}

pub struct SerenityDelivery {
    http: Arc<Http>,
}

impl SerenityDelivery {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    fn classify(channel_id: u64, err: serenity::Error) -> DeliveryError {
        match status_of(&err) {
            Some(403) => DeliveryError::PermissionDenied(channel_id),
            Some(404) => DeliveryError::ChannelUnavailable(channel_id),
            _ => DeliveryError::Other(err.to_string()),
        }
    }
}

#[async_trait]
impl Delivery for SerenityDelivery {
    async fn deliver(
        &self,
        channel: &ChannelRef,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError> {
        let allowed_mentions = match message.mention {
            Some(MentionTarget::Role(role_id)) => {
                CreateAllowedMentions::new().roles(vec![RoleId::new(role_id)])
            }
            Some(MentionTarget::Everyone) => CreateAllowedMentions::new().everyone(true),
            None => CreateAllowedMentions::new(),
        };
        let mut builder = CreateMessage::new()
            .content(message.content.clone())
            .allowed_mentions(allowed_mentions);
        if let Some(card) = &message.card {
            let mut embed = CreateEmbed::new()
                .title(card.title.clone())
                .description(card.description.clone())
                .color(EMBED_COLOR);
            if let Some(url) = &card.url {
                embed = embed.url(url.clone());
            }
            builder = builder.embed(embed);
        }

        debug!("Delivering to channel {} ({})", channel.id, channel.name);
        let sent = ChannelId::new(channel.id)
            .send_message(&self.http, builder)
            .await
            .map_err(|e| Self::classify(channel.id, e))?;

        if message.publish {
            // Only announcement channels accept this; the message itself is already out
            if let Err(e) = sent.crosspost(&self.http).await {
                warn!("Failed to publish message in channel {}: {}", channel.id, e);
            }
        }
        Ok(())
    }
}

pub struct SerenityRoles {
    http: Arc<Http>,
}

impl SerenityRoles {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RoleMutator for SerenityRoles {
    async fn grant(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await?;
        Ok(())
    }

    async fn revoke(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await?;
        Ok(())
    }
}

pub fn member_snapshot(member: &Member) -> MemberSnapshot {
    MemberSnapshot::new(
        member.user.id.get(),
        member.display_name(),
        member.roles.iter().map(|r| r.get()),
    )
}

/// Every member of the guild, paged through the HTTP API.
pub async fn fetch_all_members(http: &Http, guild_id: u64) -> anyhow::Result<Vec<MemberSnapshot>> {
    let guild_id = GuildId::new(guild_id);
    let mut snapshots = Vec::new();
    let mut after: Option<UserId> = None;
    loop {
        let page = guild_id.members(http, Some(MEMBER_PAGE), after).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.user.id);
        let full_page = page.len() as u64 == MEMBER_PAGE;
        snapshots.extend(page.iter().filter(|m| !m.user.bot).map(member_snapshot));
        if !full_page {
            break;
        }
    }
    debug!("Fetched {} members of guild {}", snapshots.len(), guild_id);
    Ok(snapshots)
}

/// One page of a forum's archived threads, newest first.
pub struct ArchivePage<C> {
    pub owners: Vec<u64>,
    /// Archive time of the last thread on the page, passed back as `before`
    pub oldest: Option<C>,
    pub has_more: bool,
}

/// Collect thread owners across every page of an archive listing.
pub async fn walk_archive<C, F, Fut>(mut fetch_page: F) -> anyhow::Result<BTreeSet<u64>>
where
    C: Copy + PartialEq,
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = anyhow::Result<ArchivePage<C>>>,
{
    let mut owners = BTreeSet::new();
    let mut before = None;
    loop {
        let page = fetch_page(before).await?;
        owners.extend(page.owners);
        if !page.has_more {
            break;
        }
        match page.oldest {
            Some(cursor) if Some(cursor) != before => before = Some(cursor),
            _ => {
                warn!("Archived thread listing stopped advancing, using {} owners", owners.len());
                break;
            }
        }
    }
    Ok(owners)
}

/// Owners of every active and archived thread in the forum.
pub async fn forum_thread_owners(
    http: &Http,
    guild_id: u64,
    forum_id: u64,
) -> anyhow::Result<BTreeSet<u64>> {
    let forum = ChannelId::new(forum_id);
    let mut owners = BTreeSet::new();

    let active = GuildId::new(guild_id).get_active_threads(http).await?;
    owners.extend(
        active
            .threads
            .iter()
            .filter(|t| t.parent_id == Some(forum))
            .filter_map(|t| t.owner_id)
            .map(|id| id.get()),
    );

    let archived = walk_archive(|before| async move {
        let page = forum
            .get_archived_public_threads(http, before, Some(ARCHIVED_THREAD_PAGE))
            .await?;
        Ok::<_, anyhow::Error>(ArchivePage {
            owners: page
                .threads
                .iter()
                .filter_map(|t| t.owner_id)
                .map(|id| id.get())
                .collect(),
            oldest: page
                .threads
                .last()
                .and_then(|t| t.thread_metadata.as_ref())
                .and_then(|m| m.archive_timestamp)
                .map(|ts| ts.unix_timestamp().max(0) as u64),
            has_more: page.has_more,
        })
    })
    .await?;
    owners.extend(archived);

    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Threads archived at times 150 down to 1, owner id equal to the time
    fn page_before(before: Option<u32>) -> ArchivePage<u32> {
        let start = before.unwrap_or(151);
        let times: Vec<u32> = (1..start).rev().take(ARCHIVED_THREAD_PAGE as usize).collect();
        ArchivePage {
            owners: times.iter().map(|t| *t as u64).collect(),
            oldest: times.last().copied(),
            has_more: times.last().is_some_and(|t| *t > 1),
        }
    }

    #[tokio::test]
    async fn archive_walk_reads_past_the_first_page() {
        let calls = AtomicUsize::new(0);
        let owners = walk_archive(|before| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page_before(before)) }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(owners.len(), 150);
        assert!(owners.contains(&1));
        assert!(owners.contains(&150));
    }

    #[tokio::test]
    async fn archive_walk_stops_when_cursor_does_not_move() {
        let calls = AtomicUsize::new(0);
        let owners = walk_archive(|_before: Option<u32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(ArchivePage {
                    owners: vec![7],
                    oldest: Some(3),
                    has_more: true,
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(owners.into_iter().collect::<Vec<_>>(), vec![7]);
    }
}
