use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub discord_token: String,
    pub owner_id: Option<u64>,
    pub database_url: String,
    pub dev_guild_id: Option<u64>,
    pub register_commands: bool,
    pub status_message: String,

    // Poller defaults; runtime overrides live in the document store
    pub poll_interval_secs: u64,
    pub history_cache_size: usize,
    pub http_timeout_secs: u64,

    // Upstream credentials used until an owner stores their own
    pub curseforge_api_key: Option<String>,
    pub twitch_client_id: Option<String>,
    pub twitch_oauth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/trackbot.db".to_string()),
            dev_guild_id: env::var("DEV_GUILD_ID").ok().and_then(|id| id.parse().ok()),
            register_commands: env::var("REGISTER_COMMANDS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Watching for updates".to_string()),
            poll_interval_secs: env::var("POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| DEFAULT_POLL_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                .max(MIN_POLL_INTERVAL_SECS),
            history_cache_size: env::var("HISTORY_CACHE_SIZE")
                .unwrap_or_else(|_| DEFAULT_HISTORY_CACHE_SIZE.to_string())
                .parse()
                .unwrap_or(DEFAULT_HISTORY_CACHE_SIZE),
            http_timeout_secs: env::var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            curseforge_api_key: non_empty_var("CURSEFORGE_API_KEY"),
            twitch_client_id: non_empty_var("TWITCH_CLIENT_ID"),
            twitch_oauth_token: non_empty_var("TWITCH_OAUTH_TOKEN"),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("owner_id", &self.owner_id)
            .field("database_url", &self.database_url)
            .field("dev_guild_id", &self.dev_guild_id)
            .field("register_commands", &self.register_commands)
            .field("status_message", &self.status_message)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("history_cache_size", &self.history_cache_size)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field(
                "curseforge_api_key",
                &self.curseforge_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("twitch_client_id", &self.twitch_client_id)
            .field(
                "twitch_oauth_token",
                &self.twitch_oauth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
/// Lower bound for any poll interval, runtime overrides included
pub const MIN_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HISTORY_CACHE_SIZE: usize = 500;

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
/// Embed description limit is 4096 characters
pub const DISCORD_EMBED_LIMIT: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Missing token
        env::remove_var("DISCORD_TOKEN");
        let result = Config::build();
        assert!(result.is_err(), "Should fail when DISCORD_TOKEN is missing");

        // 2. Defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        env::remove_var("POLL_INTERVAL_SECS");
        env::remove_var("HISTORY_CACHE_SIZE");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(config.history_cache_size, DEFAULT_HISTORY_CACHE_SIZE);

        // 3. Interval clamped to the floor
        env::set_var("POLL_INTERVAL_SECS", "1");
        let config = Config::build().unwrap();
        assert_eq!(config.poll_interval_secs, MIN_POLL_INTERVAL_SECS);

        // 4. Debug redaction
        env::set_var("CURSEFORGE_API_KEY", "secret_api_key");
        env::set_var("TWITCH_OAUTH_TOKEN", "secret_oauth");
        let config = Config::build().unwrap();
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("test_token"));
        assert!(!debug_output.contains("secret_api_key"));
        assert!(!debug_output.contains("secret_oauth"));
        assert!(debug_output.contains("[REDACTED]"));

        // 5. Blank secrets count as unset
        env::set_var("CURSEFORGE_API_KEY", "   ");
        let config = Config::build().unwrap();
        assert!(config.curseforge_api_key.is_none());

        env::remove_var("DISCORD_TOKEN");
        env::remove_var("POLL_INTERVAL_SECS");
        env::remove_var("CURSEFORGE_API_KEY");
        env::remove_var("TWITCH_OAUTH_TOKEN");
    }
}
