use crate::db::{guild_scope, Database, Document, Versioned};
use crate::roles::MemberSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const STEAM_ID_PREFIX: &str = "76561";
const STEAM_ID_LEN: usize = 17;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SteamIdError {
    #[error("`{0}` is not a valid SteamID64 (17 digits starting with 76561)")]
    Invalid(String),
}

pub fn validate_steam_id(raw: &str) -> Result<String, SteamIdError> {
    let id = raw.trim();
    let valid = id.len() == STEAM_ID_LEN
        && id.starts_with(STEAM_ID_PREFIX)
        && id.chars().all(|c| c.is_ascii_digit());
    if valid {
        Ok(id.to_string())
    } else {
        Err(SteamIdError::Invalid(id.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteamWhitelistState {
    /// Members holding any of these roles are exported
    #[serde(default)]
    pub roles: Vec<u64>,
    /// Always exported, unless banned
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub bans: Vec<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Versioned for SteamWhitelistState {
    const VERSION: u32 = 1;
}

impl Document for SteamWhitelistState {
    const KEY: &'static str = "steam_whitelist";
}

impl SteamWhitelistState {
    pub fn qualifies(&self, member: &MemberSnapshot) -> bool {
        member.has_any(&self.roles)
    }

    pub fn add_role(&mut self, role_id: u64) -> bool {
        push_unique(&mut self.roles, role_id)
    }

    pub fn remove_role(&mut self, role_id: u64) -> bool {
        remove_value(&mut self.roles, &role_id)
    }

    pub fn permit(&mut self, steam_id: String) -> bool {
        push_unique(&mut self.whitelist, steam_id)
    }

    pub fn revoke(&mut self, steam_id: &str) -> bool {
        remove_value(&mut self.whitelist, &steam_id.to_string())
    }

    /// Banning also drops the id from the permanent whitelist.
    pub fn ban(&mut self, steam_id: String) -> bool {
        self.revoke(&steam_id);
        push_unique(&mut self.bans, steam_id)
    }

    pub fn unban(&mut self, steam_id: &str) -> bool {
        remove_value(&mut self.bans, &steam_id.to_string())
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) -> bool {
    if list.contains(&value) {
        return false;
    }
    list.push(value);
    true
}

fn remove_value<T: PartialEq>(list: &mut Vec<T>, value: &T) -> bool {
    let before = list.len();
    list.retain(|v| v != value);
    list.len() != before
}

/// Permanent entries first, then qualifying members' ids. Bans always win.
pub fn compose_whitelist(
    state: &SteamWhitelistState,
    members: &[MemberSnapshot],
    steam_ids: &HashMap<u64, String>,
) -> Vec<String> {
    let bans: HashSet<&str> = state.bans.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let member_ids = members
        .iter()
        .filter(|m| state.qualifies(m))
        .filter_map(|m| steam_ids.get(&m.user_id));

    state
        .whitelist
        .iter()
        .chain(member_ids)
        .filter(|id| !bans.contains(id.as_str()))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameCollectorState {
    #[serde(default)]
    pub role: Option<u64>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Versioned for NameCollectorState {
    const VERSION: u32 = 1;
}

impl Document for NameCollectorState {
    const KEY: &'static str = "name_collector";
}

impl NameCollectorState {
    pub fn qualifies(&self, member: &MemberSnapshot) -> bool {
        self.role.is_some_and(|role| member.has_role(role))
    }
}

pub fn collect_names(state: &NameCollectorState, members: &[MemberSnapshot]) -> Vec<String> {
    members
        .iter()
        .filter(|m| state.qualifies(m))
        .map(|m| m.display_name.clone())
        .collect()
}

/// Write one entry per line into `<path>.tmp`, then rename over `path`.
pub async fn write_atomically(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut body = lines.join("\n");
    body.push('\n');
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Check that `path` can be created or appended to, without truncating it.
pub async fn check_writable(path: &Path) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map(|_| ())
}

/// Which exports a membership change affects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportFlips {
    pub whitelist: bool,
    pub names: bool,
}

pub struct ExportService {
    db: Database,
}

impl ExportService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn whitelist_state(&self, guild_id: u64) -> anyhow::Result<SteamWhitelistState> {
        self.db
            .run_blocking(move |db| db.load_document(&guild_scope(guild_id)))
            .await
    }

    pub async fn name_state(&self, guild_id: u64) -> anyhow::Result<NameCollectorState> {
        self.db
            .run_blocking(move |db| db.load_document(&guild_scope(guild_id)))
            .await
    }

    pub async fn update_whitelist<T: Send + 'static>(
        &self,
        guild_id: u64,
        edit: impl FnOnce(&mut SteamWhitelistState) -> T + Send + 'static,
    ) -> anyhow::Result<T> {
        self.db
            .run_blocking(move |db| {
                let scope = guild_scope(guild_id);
                let mut state: SteamWhitelistState = db.load_document(&scope)?;
                let out = edit(&mut state);
                db.save_document(&scope, &state)?;
                Ok(out)
            })
            .await
    }

    pub async fn update_names<T: Send + 'static>(
        &self,
        guild_id: u64,
        edit: impl FnOnce(&mut NameCollectorState) -> T + Send + 'static,
    ) -> anyhow::Result<T> {
        self.db
            .run_blocking(move |db| {
                let scope = guild_scope(guild_id);
                let mut state: NameCollectorState = db.load_document(&scope)?;
                let out = edit(&mut state);
                db.save_document(&scope, &state)?;
                Ok(out)
            })
            .await
    }

    /// Guilds with a whitelist configured.
    pub async fn whitelist_guilds(&self) -> anyhow::Result<Vec<u64>> {
        let scopes = self
            .db
            .run_blocking(|db| db.scopes_with_key(SteamWhitelistState::KEY))
            .await?;
        Ok(scopes.iter().filter_map(|s| s.parse().ok()).collect())
    }

    pub async fn set_steam_id(&self, user_id: u64, raw: &str) -> anyhow::Result<Result<String, SteamIdError>> {
        let steam_id = match validate_steam_id(raw) {
            Ok(id) => id,
            Err(e) => return Ok(Err(e)),
        };
        let stored = steam_id.clone();
        self.db
            .run_blocking(move |db| db.set_steam_id(user_id, &stored))
            .await?;
        Ok(Ok(steam_id))
    }

    pub async fn steam_id(&self, user_id: u64) -> anyhow::Result<Option<String>> {
        self.db.run_blocking(move |db| db.get_steam_id(user_id)).await
    }

    pub async fn forget_steam_id(&self, user_id: u64) -> anyhow::Result<bool> {
        self.db
            .run_blocking(move |db| db.delete_steam_id(user_id))
            .await
    }

    /// Compare a member before and after a change.
    pub async fn flips(
        &self,
        guild_id: u64,
        before: &MemberSnapshot,
        after: &MemberSnapshot,
    ) -> anyhow::Result<ExportFlips> {
        let whitelist = self.whitelist_state(guild_id).await?;
        let names = self.name_state(guild_id).await?;
        Ok(ExportFlips {
            whitelist: whitelist.qualifies(before) != whitelist.qualifies(after),
            names: names.qualifies(before) != names.qualifies(after),
        })
    }

    /// Which exports a departing member was part of.
    pub async fn departure(&self, guild_id: u64, member: &MemberSnapshot) -> anyhow::Result<ExportFlips> {
        let leaving = MemberSnapshot::new(member.user_id, member.display_name.clone(), []);
        self.flips(guild_id, member, &leaving).await
    }

    /// Export the whitelist file. `None` when no file is configured.
    pub async fn export_whitelist(
        &self,
        guild_id: u64,
        members: &[MemberSnapshot],
    ) -> anyhow::Result<Option<usize>> {
        let state = self.whitelist_state(guild_id).await?;
        let Some(path) = state.file.clone() else {
            debug!("SteamWhitelist: no output file for guild {}", guild_id);
            return Ok(None);
        };
        let steam_ids = self.db.run_blocking(|db| db.all_steam_ids()).await?;
        let entries = compose_whitelist(&state, members, &steam_ids);
        write_atomically(&path, &entries).await?;
        info!(
            "SteamWhitelist: wrote {} entries for guild {} to {}",
            entries.len(),
            guild_id,
            path.display()
        );
        Ok(Some(entries.len()))
    }

    pub async fn export_names(
        &self,
        guild_id: u64,
        members: &[MemberSnapshot],
    ) -> anyhow::Result<Option<usize>> {
        let state = self.name_state(guild_id).await?;
        let Some(path) = state.file.clone() else {
            return Ok(None);
        };
        if state.role.is_none() {
            return Ok(None);
        }
        let names = collect_names(&state, members);
        write_atomically(&path, &names).await?;
        info!(
            "RoleNameCollector: wrote {} names for guild {} to {}",
            names.len(),
            guild_id,
            path.display()
        );
        Ok(Some(names.len()))
    }
}
