pub mod commands;
pub mod config;
pub mod db;
pub mod discord;
pub mod events;
pub mod poller;
pub mod roles;
pub mod services;
pub mod trackers;

use poise::serenity_prelude as serenity;
use poller::scheduler::TrackerHandle;
use poller::TrackerKind;
use std::sync::Arc;

/// Custom data passed to all commands
pub struct Data {
    pub config: Arc<config::Config>,
    pub db: db::Database,
    pub http: Arc<serenity::Http>,
    pub tracking: services::tracking::TrackingStore,
    pub cfmod: TrackerHandle,
    pub tube: TrackerHandle,
    pub twitch: TrackerHandle,
    /// Direct Helix access for the schedule listing
    pub twitch_api: Arc<trackers::twitch::TwitchFetcher>,
    pub linked_roles: Arc<roles::linked::LinkedRoleService>,
    pub adforum: Arc<roles::forum::AdForumService>,
    pub exports: Arc<roles::export::ExportService>,
    pub roles: Arc<discord::SerenityRoles>,
}

impl Data {
    pub fn tracker(&self, kind: TrackerKind) -> &TrackerHandle {
        match kind {
            TrackerKind::CurseForge => &self.cfmod,
            TrackerKind::YouTube => &self.tube,
            TrackerKind::Twitch => &self.twitch,
        }
    }
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
