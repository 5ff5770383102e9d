use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string. When unset the quota budget is kept in-process.
    pub redis_url: Option<String>,

    /// YouTube Data API v3 key
    pub youtube_api_key: String,

    /// YouTube Data API base URL (overridable for tests and proxies)
    pub youtube_api_base_url: String,

    /// Discord bot token used to post notifications
    pub discord_bot_token: String,

    /// Discord REST API base URL
    pub discord_api_base_url: String,

    /// Default interval between two checks of the same watch (default: 900 = 15 min)
    pub check_interval_secs: u64,

    /// Maximum number of checks running at once (default: 4)
    pub max_concurrent_checks: usize,

    /// Provider calls allowed per quota window, shared by every watch (default: 100)
    pub quota_max_calls: u64,

    /// Length of the quota window in seconds (default: 3600)
    pub quota_window_secs: u64,

    /// Backoff applied on a throttle response without a retry hint (default: 300)
    pub rate_limit_backoff_secs: u64,

    /// Upper bound of the per-watch exponential backoff (default: 3600)
    pub max_backoff_secs: u64,

    /// Items requested per fetch (default: 10, clamped to 1..=50)
    pub feed_page_size: u32,

    /// How often the watch list is re-read from the database (default: 60)
    pub watch_refresh_secs: u64,

    /// HTTP port of the API server (default: 3000)
    pub api_port: u16,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            youtube_api_key: std::env::var("YOUTUBE_API_KEY")
                .map_err(|_| anyhow::anyhow!("YOUTUBE_API_KEY environment variable is required"))?,
            youtube_api_base_url: std::env::var("YOUTUBE_API_BASE_URL")
                .unwrap_or_else(|_| "https://www.googleapis.com/youtube/v3".to_string()),
            discord_bot_token: std::env::var("DISCORD_BOT_TOKEN").map_err(|_| {
                anyhow::anyhow!("DISCORD_BOT_TOKEN environment variable is required")
            })?,
            discord_api_base_url: std::env::var("DISCORD_API_BASE_URL")
                .unwrap_or_else(|_| "https://discord.com/api/v10".to_string()),
            check_interval_secs: parse_var("CHECK_INTERVAL_SECS", 900)?,
            max_concurrent_checks: parse_var("MAX_CONCURRENT_CHECKS", 4)?,
            quota_max_calls: parse_var("QUOTA_MAX_CALLS", 100)?,
            quota_window_secs: parse_var("QUOTA_WINDOW_SECS", 3600)?,
            rate_limit_backoff_secs: parse_var("RATE_LIMIT_BACKOFF_SECS", 300)?,
            max_backoff_secs: parse_var("MAX_BACKOFF_SECS", 3600)?,
            feed_page_size: parse_var::<u32>("FEED_PAGE_SIZE", 10)?.clamp(1, 50),
            watch_refresh_secs: parse_var("WATCH_REFRESH_SECS", 60)?,
            api_port: parse_var("API_PORT", 3000)?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn quota_window(&self) -> Duration {
        Duration::from_secs(self.quota_window_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn watch_refresh(&self) -> Duration {
        Duration::from_secs(self.watch_refresh_secs)
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
