//! Notification journal: one row per acknowledged dispatch, readable per guild.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{FeedItem, NotificationLog, WatchedChannel};

/// Default number of log rows returned when no limit is given.
pub const DEFAULT_LOG_LIMIT: i64 = 10;

/// Upper bound on requested log rows.
pub const MAX_LOG_LIMIT: i64 = 50;

/// Validate a requested row count, applying the default.
pub fn log_limit(requested: Option<i64>) -> Result<i64, AppError> {
    let limit = requested.unwrap_or(DEFAULT_LOG_LIMIT);
    if !(1..=MAX_LOG_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LOG_LIMIT
        )));
    }
    Ok(limit)
}

#[async_trait]
pub trait NotificationJournal: Send + Sync {
    async fn record(&self, watch: &WatchedChannel, item: &FeedItem) -> Result<(), AppError>;

    /// Most recent entries for a guild, newest first.
    async fn recent_for_guild(
        &self,
        guild_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationLog>, AppError>;
}

#[derive(Clone)]
pub struct PgJournal {
    pool: PgPool,
}

impl PgJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationJournal for PgJournal {
    async fn record(&self, watch: &WatchedChannel, item: &FeedItem) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_logs
                (guild_id, channel_id, channel_name, item_id, item_title, live_status, permalink, destination_id, role_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&watch.guild_id)
        .bind(&watch.channel_id)
        .bind(channel_name(watch, item))
        .bind(&item.item_id)
        .bind(&item.title)
        .bind(item.live_status.to_string())
        .bind(&item.permalink)
        .bind(&watch.destination_id)
        .bind(&watch.role_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_for_guild(
        &self,
        guild_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationLog>, AppError> {
        let logs: Vec<NotificationLog> = sqlx::query_as(
            r#"
            SELECT * FROM notification_logs
            WHERE guild_id = $1
            ORDER BY notified_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(guild_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }
}

/// In-memory journal for tests and embedding.
#[derive(Default)]
pub struct InMemoryJournal {
    entries: Mutex<Vec<NotificationLog>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationJournal for InMemoryJournal {
    async fn record(&self, watch: &WatchedChannel, item: &FeedItem) -> Result<(), AppError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let id = entries.len() as i64 + 1;
        entries.push(NotificationLog {
            id,
            guild_id: watch.guild_id.clone(),
            channel_id: watch.channel_id.clone(),
            channel_name: channel_name(watch, item),
            item_id: item.item_id.clone(),
            item_title: item.title.clone(),
            live_status: item.live_status,
            permalink: item.permalink.clone(),
            destination_id: watch.destination_id.clone(),
            role_id: watch.role_id.clone(),
            notified_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_for_guild(
        &self,
        guild_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationLog>, AppError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .rev()
            .filter(|log| log.guild_id == guild_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

fn channel_name(watch: &WatchedChannel, item: &FeedItem) -> Option<String> {
    if item.channel_title.is_empty() {
        watch.channel_name.clone()
    } else {
        Some(item.channel_title.clone())
    }
}
