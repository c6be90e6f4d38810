//! Membership-driven role and export reconciliation.
//!
//! Every feature here reduces a guild membership snapshot plus its stored
//! configuration to a minimal set of [`RoleChange`]s (or an exported file).
//! Gateway events and manual resync commands call the same functions, so a
//! second pass over an already converged guild changes nothing.

pub mod export;
pub mod forum;
pub mod linked;

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub user_id: u64,
    pub display_name: String,
    pub roles: HashSet<u64>,
}

impl MemberSnapshot {
    pub fn new(
        user_id: u64,
        display_name: impl Into<String>,
        roles: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role_id: u64) -> bool {
        self.roles.contains(&role_id)
    }

    pub fn has_any(&self, role_ids: &[u64]) -> bool {
        role_ids.iter().any(|id| self.roles.contains(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleChange {
    Grant { user_id: u64, role_id: u64 },
    Revoke { user_id: u64, role_id: u64 },
}

impl RoleChange {
    /// Reflect the change in a snapshot, as the guild would after applying it.
    pub fn apply_to(&self, member: &mut MemberSnapshot) {
        match *self {
            RoleChange::Grant { user_id, role_id } if user_id == member.user_id => {
                member.roles.insert(role_id);
            }
            RoleChange::Revoke { user_id, role_id } if user_id == member.user_id => {
                member.roles.remove(&role_id);
            }
            _ => {}
        }
    }
}

#[async_trait]
pub trait RoleMutator: Send + Sync {
    async fn grant(&self, guild_id: u64, user_id: u64, role_id: u64, reason: &str)
        -> anyhow::Result<()>;
    async fn revoke(&self, guild_id: u64, user_id: u64, role_id: u64, reason: &str)
        -> anyhow::Result<()>;
}

/// Apply changes one by one; a failure is logged and does not stop the rest.
pub async fn apply_changes(
    mutator: &dyn RoleMutator,
    guild_id: u64,
    changes: &[RoleChange],
    reason: &str,
) -> usize {
    let mut applied = 0;
    for change in changes {
        let result = match *change {
            RoleChange::Grant { user_id, role_id } => {
                mutator.grant(guild_id, user_id, role_id, reason).await
            }
            RoleChange::Revoke { user_id, role_id } => {
                mutator.revoke(guild_id, user_id, role_id, reason).await
            }
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => warn!("Role change {:?} in guild {} failed: {}", change, guild_id, e),
        }
    }
    applied
}
