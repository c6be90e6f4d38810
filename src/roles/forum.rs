use crate::db::{guild_scope, Database, Document, Versioned};
use crate::roles::{apply_changes, MemberSnapshot, RoleChange, RoleMutator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Forum channel → role granted to thread owners in it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdForumState {
    #[serde(default)]
    pub forums: BTreeMap<u64, u64>,
}

impl Versioned for AdForumState {
    const VERSION: u32 = 1;
}

impl Document for AdForumState {
    const KEY: &'static str = "adforum";
}

/// Grant the role to thread owners lacking it, revoke it from holders without a thread.
pub fn forum_role_delta(
    role_id: u64,
    owners: &BTreeSet<u64>,
    members: &[MemberSnapshot],
) -> Vec<RoleChange> {
    let mut changes = Vec::new();
    for member in members {
        let owns_thread = owners.contains(&member.user_id);
        match (member.has_role(role_id), owns_thread) {
            (false, true) => changes.push(RoleChange::Grant {
                user_id: member.user_id,
                role_id,
            }),
            (true, false) => changes.push(RoleChange::Revoke {
                user_id: member.user_id,
                role_id,
            }),
            _ => {}
        }
    }
    changes
}

pub struct AdForumService {
    db: Database,
}

impl AdForumService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn state(&self, guild_id: u64) -> anyhow::Result<AdForumState> {
        self.db
            .run_blocking(move |db| db.load_document(&guild_scope(guild_id)))
            .await
    }

    async fn save(&self, guild_id: u64, state: AdForumState) -> anyhow::Result<()> {
        self.db
            .run_blocking(move |db| db.save_document(&guild_scope(guild_id), &state))
            .await
    }

    pub async fn role_for(&self, guild_id: u64, forum_id: u64) -> anyhow::Result<Option<u64>> {
        Ok(self.state(guild_id).await?.forums.get(&forum_id).copied())
    }

    /// Returns false when the forum is already tracked.
    pub async fn setup(&self, guild_id: u64, forum_id: u64, role_id: u64) -> anyhow::Result<bool> {
        let mut state = self.state(guild_id).await?;
        if state.forums.contains_key(&forum_id) {
            return Ok(false);
        }
        state.forums.insert(forum_id, role_id);
        self.save(guild_id, state).await?;
        Ok(true)
    }

    pub async fn delete(&self, guild_id: u64, forum_id: u64) -> anyhow::Result<bool> {
        let mut state = self.state(guild_id).await?;
        if state.forums.remove(&forum_id).is_none() {
            return Ok(false);
        }
        self.save(guild_id, state).await?;
        Ok(true)
    }

    pub async fn thread_created(
        &self,
        guild_id: u64,
        forum_id: u64,
        owner_id: u64,
        mutator: &dyn RoleMutator,
    ) -> anyhow::Result<bool> {
        let Some(role_id) = self.role_for(guild_id, forum_id).await? else {
            return Ok(false);
        };
        debug!("AdForum: thread by {} in forum {}", owner_id, forum_id);
        let change = RoleChange::Grant {
            user_id: owner_id,
            role_id,
        };
        Ok(apply_changes(mutator, guild_id, &[change], "AdForum thread created").await == 1)
    }

    /// Converge the forum's role onto the owners of its threads. `None` if untracked.
    pub async fn sync(
        &self,
        guild_id: u64,
        forum_id: u64,
        owners: &BTreeSet<u64>,
        members: &[MemberSnapshot],
        mutator: &dyn RoleMutator,
    ) -> anyhow::Result<Option<usize>> {
        let Some(role_id) = self.role_for(guild_id, forum_id).await? else {
            return Ok(None);
        };
        let changes = forum_role_delta(role_id, owners, members);
        let applied = apply_changes(mutator, guild_id, &changes, "AdForum thread sync").await;
        info!(
            "AdForum: synced forum {} in guild {}, {} role changes",
            forum_id, guild_id, applied
        );
        Ok(Some(applied))
    }
}
