//! Watch service: CRUD for the (guild, external channel) watches.
//!
//! A watch links a guild to an external channel, a destination channel and an
//! optional role to mention. The scheduler reads active watches through
//! [`WatchStore`]; the HTTP surface goes through [`WatchService`], which adds
//! validation, provider lookups and cursor cleanup.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{ChannelIdentity, WatchKey, WatchedChannel};
use herald_feed::{ChannelDirectory, is_valid_channel_id};

use crate::cursor::CursorStore;

/// Shortest per-watch interval accepted.
pub const MIN_CHECK_INTERVAL_SECS: i64 = 60;

/// Longest per-watch interval accepted (one week).
pub const MAX_CHECK_INTERVAL_SECS: i64 = 7 * 24 * 3600;

/// Parameters for adding (or reconfiguring) a watch.
#[derive(Debug, Clone, Deserialize)]
pub struct AddWatchParams {
    pub channel_id: String,
    pub destination_id: String,
    pub role_id: Option<String>,
    pub check_interval_secs: Option<i64>,
}

/// Persistence for watches. Also the configuration source of the scheduler.
#[async_trait]
pub trait WatchStore: Send + Sync {
    /// Every watch that is not suspended.
    async fn list_watched_channels(&self) -> Result<Vec<WatchedChannel>, AppError>;
    async fn list_for_guild(&self, guild_id: &str) -> Result<Vec<WatchedChannel>, AppError>;
    async fn get(&self, key: &WatchKey) -> Result<Option<WatchedChannel>, AppError>;
    /// Insert or reconfigure; always clears the suspended flag.
    async fn upsert(
        &self,
        guild_id: &str,
        params: &AddWatchParams,
        channel_name: Option<&str>,
    ) -> Result<WatchedChannel, AppError>;
    async fn remove(&self, key: &WatchKey) -> Result<bool, AppError>;
    async fn set_suspended(&self, key: &WatchKey, suspended: bool) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PgWatchStore {
    pool: PgPool,
}

impl PgWatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatchStore for PgWatchStore {
    async fn list_watched_channels(&self) -> Result<Vec<WatchedChannel>, AppError> {
        let watches: Vec<WatchedChannel> = sqlx::query_as(
            "SELECT * FROM watched_channels WHERE suspended = false ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(watches)
    }

    async fn list_for_guild(&self, guild_id: &str) -> Result<Vec<WatchedChannel>, AppError> {
        let watches: Vec<WatchedChannel> = sqlx::query_as(
            "SELECT * FROM watched_channels WHERE guild_id = $1 ORDER BY created_at DESC",
        )
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(watches)
    }

    async fn get(&self, key: &WatchKey) -> Result<Option<WatchedChannel>, AppError> {
        let watch: Option<WatchedChannel> = sqlx::query_as(
            "SELECT * FROM watched_channels WHERE guild_id = $1 AND channel_id = $2",
        )
        .bind(&key.guild_id)
        .bind(&key.channel_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(watch)
    }

    async fn upsert(
        &self,
        guild_id: &str,
        params: &AddWatchParams,
        channel_name: Option<&str>,
    ) -> Result<WatchedChannel, AppError> {
        let watch: WatchedChannel = sqlx::query_as(
            r#"
            INSERT INTO watched_channels
                (guild_id, channel_id, channel_name, destination_id, role_id, check_interval_secs, suspended)
            VALUES ($1, $2, $3, $4, $5, $6, false)
            ON CONFLICT (guild_id, channel_id) DO UPDATE
            SET channel_name = EXCLUDED.channel_name,
                destination_id = EXCLUDED.destination_id,
                role_id = EXCLUDED.role_id,
                check_interval_secs = EXCLUDED.check_interval_secs,
                suspended = false,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(guild_id)
        .bind(&params.channel_id)
        .bind(channel_name)
        .bind(&params.destination_id)
        .bind(&params.role_id)
        .bind(params.check_interval_secs)
        .fetch_one(&self.pool)
        .await?;

        Ok(watch)
    }

    async fn remove(&self, key: &WatchKey) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM watched_channels WHERE guild_id = $1 AND channel_id = $2")
                .bind(&key.guild_id)
                .bind(&key.channel_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_suspended(&self, key: &WatchKey, suspended: bool) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE watched_channels
            SET suspended = $3, updated_at = NOW()
            WHERE guild_id = $1 AND channel_id = $2
            "#,
        )
        .bind(&key.guild_id)
        .bind(&key.channel_id)
        .bind(suspended)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory watch store. No persistence.
#[derive(Default)]
pub struct InMemoryWatchStore {
    watches: Mutex<BTreeMap<WatchKey, WatchedChannel>>,
}

impl InMemoryWatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatchStore for InMemoryWatchStore {
    async fn list_watched_channels(&self) -> Result<Vec<WatchedChannel>, AppError> {
        let watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(watches.values().filter(|w| !w.suspended).cloned().collect())
    }

    async fn list_for_guild(&self, guild_id: &str) -> Result<Vec<WatchedChannel>, AppError> {
        let watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(watches
            .values()
            .filter(|w| w.guild_id == guild_id)
            .cloned()
            .collect())
    }

    async fn get(&self, key: &WatchKey) -> Result<Option<WatchedChannel>, AppError> {
        let watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(watches.get(key).cloned())
    }

    async fn upsert(
        &self,
        guild_id: &str,
        params: &AddWatchParams,
        channel_name: Option<&str>,
    ) -> Result<WatchedChannel, AppError> {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        let key = WatchKey::new(guild_id, params.channel_id.clone());
        let now = Utc::now();
        let created_at = watches.get(&key).map_or(now, |w| w.created_at);

        let watch = WatchedChannel {
            guild_id: guild_id.to_string(),
            channel_id: params.channel_id.clone(),
            channel_name: channel_name.map(str::to_string),
            destination_id: params.destination_id.clone(),
            role_id: params.role_id.clone(),
            check_interval_secs: params.check_interval_secs,
            suspended: false,
            created_at,
            updated_at: now,
        };
        watches.insert(key, watch.clone());
        Ok(watch)
    }

    async fn remove(&self, key: &WatchKey) -> Result<bool, AppError> {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(watches.remove(key).is_some())
    }

    async fn set_suspended(&self, key: &WatchKey, suspended: bool) -> Result<(), AppError> {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(watch) = watches.get_mut(key) {
            watch.suspended = suspended;
            watch.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// Service layer for watch operations exposed to the surrounding system.
pub struct WatchService {
    store: Arc<dyn WatchStore>,
    cursors: Arc<dyn CursorStore>,
    directory: Arc<dyn ChannelDirectory>,
}

impl WatchService {
    pub fn new(
        store: Arc<dyn WatchStore>,
        cursors: Arc<dyn CursorStore>,
        directory: Arc<dyn ChannelDirectory>,
    ) -> Self {
        Self {
            store,
            cursors,
            directory,
        }
    }

    pub async fn list_for_guild(&self, guild_id: &str) -> Result<Vec<WatchedChannel>, AppError> {
        validate_snowflake("guild_id", guild_id)?;
        self.store.list_for_guild(guild_id).await
    }

    /// Add a watch, or reconfigure an existing one.
    ///
    /// The channel is resolved at the provider first so unknown ids are
    /// rejected and the display name is captured. Re-adding a suspended watch
    /// resumes it. An existing cursor is kept.
    pub async fn add_watch(
        &self,
        guild_id: &str,
        params: &AddWatchParams,
    ) -> Result<WatchedChannel, AppError> {
        validate_snowflake("guild_id", guild_id)?;
        validate_snowflake("destination_id", &params.destination_id)?;
        if let Some(role_id) = &params.role_id {
            validate_snowflake("role_id", role_id)?;
        }
        if !is_valid_channel_id(&params.channel_id) {
            return Err(AppError::Validation(format!(
                "Invalid channel_id '{}': expected 'UC' followed by 22 characters",
                params.channel_id
            )));
        }
        if let Some(secs) = params.check_interval_secs {
            validate_interval(secs)?;
        }

        let identity = self
            .directory
            .describe_channel(&params.channel_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Channel {} not found", params.channel_id))
            })?;

        let watch = self
            .store
            .upsert(guild_id, params, Some(identity.title.as_str()))
            .await?;

        tracing::info!(
            guild_id,
            channel_id = %watch.channel_id,
            destination_id = %watch.destination_id,
            "Watch added"
        );

        Ok(watch)
    }

    /// Remove a watch and its cursor. Returns true if the watch existed.
    pub async fn remove_watch(&self, guild_id: &str, channel_id: &str) -> Result<bool, AppError> {
        let key = WatchKey::new(guild_id, channel_id);
        let removed = self.store.remove(&key).await?;
        self.cursors.remove(&key).await?;

        if removed {
            tracing::info!(watch = %key, "Watch removed");
        }
        Ok(removed)
    }

    pub async fn find_channel_by_handle(&self, handle: &str) -> Result<ChannelIdentity, AppError> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(AppError::Validation("handle must not be empty".to_string()));
        }

        self.directory
            .find_channel_by_handle(handle)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No channel matches '{}'", handle)))
    }
}

/// Discord ids are 17–20 digit snowflakes.
fn validate_snowflake(field: &str, value: &str) -> Result<(), AppError> {
    let ok = (17..=20).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{} must be a numeric Discord id, got '{}'",
            field, value
        )))
    }
}

fn validate_interval(secs: i64) -> Result<(), AppError> {
    if (MIN_CHECK_INTERVAL_SECS..=MAX_CHECK_INTERVAL_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "check_interval_secs must be between {} and {}",
            MIN_CHECK_INTERVAL_SECS, MAX_CHECK_INTERVAL_SECS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_snowflake() {
        assert!(validate_snowflake("guild_id", "123456789012345678").is_ok());
        assert!(validate_snowflake("guild_id", "12345").is_err());
        assert!(validate_snowflake("guild_id", "12345678901234567a").is_err());
    }

    #[test]
    fn test_validate_interval_bounds() {
        assert!(validate_interval(MIN_CHECK_INTERVAL_SECS).is_ok());
        assert!(validate_interval(MAX_CHECK_INTERVAL_SECS).is_ok());
        assert!(validate_interval(59).is_err());
        assert!(validate_interval(MAX_CHECK_INTERVAL_SECS + 1).is_err());
        assert!(validate_interval(i64::MAX).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_upsert_clears_suspension() {
        let store = InMemoryWatchStore::new();
        let params = AddWatchParams {
            channel_id: "UC_x5XG1OV2P6uZZ5FSM9Ttw".to_string(),
            destination_id: "223456789012345678".to_string(),
            role_id: None,
            check_interval_secs: None,
        };
        let watch = store
            .upsert("123456789012345678", &params, Some("Name"))
            .await
            .unwrap();
        store.set_suspended(&watch.key(), true).await.unwrap();
        assert!(store.list_watched_channels().await.unwrap().is_empty());

        store
            .upsert("123456789012345678", &params, Some("Name"))
            .await
            .unwrap();
        assert_eq!(store.list_watched_channels().await.unwrap().len(), 1);
    }
}
