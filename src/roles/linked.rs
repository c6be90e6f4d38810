use crate::db::{guild_scope, Database, Document, Versioned};
use crate::roles::{apply_changes, MemberSnapshot, RoleChange, RoleMutator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkedRoleError {
    #[error("that role is already set up as a linked role")]
    AlreadyLinked,
    #[error("that role is not set up as a linked role")]
    NotLinked,
    #[error("that role is already a reference role for this linked role")]
    AlreadyReference,
    #[error("that role is not a reference role for this linked role")]
    NotReference,
}

/// Linked roles of one guild and the roles suspended per member.
///
/// A linked role is kept only while its holder has at least one of its
/// reference roles. When the last reference role goes, the linked role is
/// revoked and remembered; regaining a reference role restores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedRoleState {
    #[serde(default)]
    pub links: BTreeMap<u64, Vec<u64>>,
    #[serde(default)]
    pub suspended: BTreeMap<u64, BTreeSet<u64>>,
}

impl Versioned for LinkedRoleState {
    const VERSION: u32 = 1;
}

impl Document for LinkedRoleState {
    const KEY: &'static str = "linked_roles";
}

impl LinkedRoleState {
    pub fn setup(&mut self, role_id: u64) -> Result<(), LinkedRoleError> {
        if self.links.contains_key(&role_id) {
            return Err(LinkedRoleError::AlreadyLinked);
        }
        self.links.insert(role_id, Vec::new());
        Ok(())
    }

    /// Drop a linked role and forget it for every member.
    pub fn delete(&mut self, role_id: u64) -> Result<(), LinkedRoleError> {
        if self.links.remove(&role_id).is_none() {
            return Err(LinkedRoleError::NotLinked);
        }
        for roles in self.suspended.values_mut() {
            roles.remove(&role_id);
        }
        self.suspended.retain(|_, roles| !roles.is_empty());
        Ok(())
    }

    pub fn add_reference(&mut self, role_id: u64, reference: u64) -> Result<(), LinkedRoleError> {
        let refs = self
            .links
            .get_mut(&role_id)
            .ok_or(LinkedRoleError::NotLinked)?;
        if refs.contains(&reference) {
            return Err(LinkedRoleError::AlreadyReference);
        }
        refs.push(reference);
        Ok(())
    }

    pub fn remove_reference(&mut self, role_id: u64, reference: u64) -> Result<(), LinkedRoleError> {
        let refs = self
            .links
            .get_mut(&role_id)
            .ok_or(LinkedRoleError::NotLinked)?;
        let before = refs.len();
        refs.retain(|r| *r != reference);
        if refs.len() == before {
            return Err(LinkedRoleError::NotReference);
        }
        Ok(())
    }

    pub fn forget_member(&mut self, user_id: u64) -> bool {
        self.suspended.remove(&user_id).is_some()
    }

    pub fn members_with_suspended_roles(&self) -> usize {
        self.suspended.len()
    }

    /// Changes needed for `member` to converge. Updates the suspended set.
    pub fn reconcile(&mut self, member: &MemberSnapshot) -> Vec<RoleChange> {
        let mut changes = Vec::new();
        for (&role_id, refs) in &self.links {
            if refs.is_empty() {
                continue;
            }
            let has_reference = member.has_any(refs);
            if member.has_role(role_id) {
                if !has_reference {
                    self.suspended
                        .entry(member.user_id)
                        .or_default()
                        .insert(role_id);
                    changes.push(RoleChange::Revoke {
                        user_id: member.user_id,
                        role_id,
                    });
                }
            } else if has_reference {
                let restored = self
                    .suspended
                    .get_mut(&member.user_id)
                    .is_some_and(|roles| roles.remove(&role_id));
                if restored {
                    changes.push(RoleChange::Grant {
                        user_id: member.user_id,
                        role_id,
                    });
                }
            }
        }
        self.suspended.retain(|_, roles| !roles.is_empty());
        changes
    }
}

/// Serialises load-reconcile-save for the linked role document.
pub struct LinkedRoleService {
    db: Database,
    lock: Mutex<()>,
}

impl LinkedRoleService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self, guild_id: u64) -> anyhow::Result<LinkedRoleState> {
        self.db
            .run_blocking(move |db| db.load_document(&guild_scope(guild_id)))
            .await
    }

    async fn save(&self, guild_id: u64, state: LinkedRoleState) -> anyhow::Result<()> {
        self.db
            .run_blocking(move |db| db.save_document(&guild_scope(guild_id), &state))
            .await
    }

    pub async fn state(&self, guild_id: u64) -> anyhow::Result<LinkedRoleState> {
        self.load(guild_id).await
    }

    /// Apply a configuration edit. The outer error is storage, the inner one the edit.
    pub async fn update(
        &self,
        guild_id: u64,
        edit: impl FnOnce(&mut LinkedRoleState) -> Result<(), LinkedRoleError> + Send,
    ) -> anyhow::Result<Result<(), LinkedRoleError>> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(guild_id).await?;
        if let Err(e) = edit(&mut state) {
            return Ok(Err(e));
        }
        self.save(guild_id, state).await?;
        Ok(Ok(()))
    }

    pub async fn process_member(
        &self,
        guild_id: u64,
        member: &MemberSnapshot,
        mutator: &dyn RoleMutator,
    ) -> anyhow::Result<usize> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(guild_id).await?;
        if state.links.is_empty() {
            return Ok(0);
        }
        let changes = state.reconcile(member);
        if changes.is_empty() {
            return Ok(0);
        }
        self.save(guild_id, state).await?;
        Ok(apply_changes(mutator, guild_id, &changes, "Linked role sync").await)
    }

    /// Full pass over the guild. Returns members left holding suspended roles.
    pub async fn resync(
        &self,
        guild_id: u64,
        members: &[MemberSnapshot],
        mutator: &dyn RoleMutator,
    ) -> anyhow::Result<usize> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(guild_id).await?;
        let mut changes = Vec::new();
        for member in members {
            changes.extend(state.reconcile(member));
        }
        let suspended = state.members_with_suspended_roles();
        self.save(guild_id, state).await?;
        let applied = apply_changes(mutator, guild_id, &changes, "Linked role sync").await;
        info!(
            "LinkedRoles: resynced guild {}, {} changes, {} members with suspended roles",
            guild_id, applied, suspended
        );
        Ok(suspended)
    }

    pub async fn member_left(&self, guild_id: u64, user_id: u64) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(guild_id).await?;
        if state.forget_member(user_id) {
            self.save(guild_id, state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::tests::RecordingMutator;

    const LINKED: u64 = 10;
    const REF_A: u64 = 20;
    const REF_B: u64 = 21;

    fn state() -> LinkedRoleState {
        let mut state = LinkedRoleState::default();
        state.setup(LINKED).unwrap();
        state.add_reference(LINKED, REF_A).unwrap();
        state.add_reference(LINKED, REF_B).unwrap();
        state
    }

    #[test]
    fn losing_all_references_suspends_then_regaining_restores() {
        let mut state = state();
        let mut member = MemberSnapshot::new(1, "a", [LINKED]);

        let changes = state.reconcile(&member);
        assert_eq!(changes, vec![RoleChange::Revoke { user_id: 1, role_id: LINKED }]);
        assert!(state.suspended[&1].contains(&LINKED));
        changes.iter().for_each(|c| c.apply_to(&mut member));

        member.roles.insert(REF_B);
        let changes = state.reconcile(&member);
        assert_eq!(changes, vec![RoleChange::Grant { user_id: 1, role_id: LINKED }]);
        assert!(state.suspended.is_empty());
    }

    #[test]
    fn reference_without_suspended_role_grants_nothing() {
        let mut state = state();
        let member = MemberSnapshot::new(1, "a", [REF_A]);
        assert!(state.reconcile(&member).is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut state = state();
        let mut members = vec![
            MemberSnapshot::new(1, "a", [LINKED]),
            MemberSnapshot::new(2, "b", [LINKED, REF_A]),
            MemberSnapshot::new(3, "c", [REF_A]),
        ];
        state.suspended.entry(3).or_default().insert(LINKED);

        let mut first = Vec::new();
        for member in &members {
            first.extend(state.reconcile(member));
        }
        assert_eq!(first.len(), 2);
        for member in members.iter_mut() {
            first.iter().for_each(|c| c.apply_to(member));
        }

        let snapshot = state.clone();
        for member in &members {
            assert!(state.reconcile(member).is_empty());
        }
        assert_eq!(state, snapshot);
    }

    #[test]
    fn config_edits_validate() {
        let mut state = state();
        assert_eq!(state.setup(LINKED), Err(LinkedRoleError::AlreadyLinked));
        assert_eq!(
            state.add_reference(LINKED, REF_A),
            Err(LinkedRoleError::AlreadyReference)
        );
        assert_eq!(state.remove_reference(LINKED, 99), Err(LinkedRoleError::NotReference));
        assert_eq!(state.add_reference(99, REF_A), Err(LinkedRoleError::NotLinked));

        state.suspended.entry(1).or_default().insert(LINKED);
        state.delete(LINKED).unwrap();
        assert!(state.links.is_empty());
        assert!(state.suspended.is_empty());
    }

    #[test]
    fn document_keys_survive_json() {
        let state = state();
        let json = serde_json::to_string(&state).unwrap();
        let back: LinkedRoleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn service_persists_and_applies() {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        let service = LinkedRoleService::new(db);
        let mutator = RecordingMutator::default();

        service
            .update(5, |s| s.setup(LINKED))
            .await
            .unwrap()
            .unwrap();
        service
            .update(5, |s| s.add_reference(LINKED, REF_A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            service.update(5, |s| s.setup(LINKED)).await.unwrap(),
            Err(LinkedRoleError::AlreadyLinked)
        );

        let member = MemberSnapshot::new(1, "a", [LINKED]);
        assert_eq!(service.process_member(5, &member, &mutator).await.unwrap(), 1);
        assert_eq!(service.state(5).await.unwrap().members_with_suspended_roles(), 1);

        let suspended = service
            .resync(5, &[MemberSnapshot::new(1, "a", [])], &mutator)
            .await
            .unwrap();
        assert_eq!(suspended, 1);

        service.member_left(5, 1).await.unwrap();
        assert_eq!(service.state(5).await.unwrap().members_with_suspended_roles(), 0);
        assert_eq!(mutator.taken().len(), 1);
    }
}
