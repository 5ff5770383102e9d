//! Cursor store: per-watch "last dispatched item" with compare-and-swap.
//!
//! Every advance names the generation it read. The write only lands if the
//! stored generation still matches, and bumps it by one. A mismatch is a
//! [`Advance::Conflict`]: another pass got there first and the caller must
//! stop rather than dispatch again.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{Cursor, CursorPosition, WatchKey};

/// Result of a compare-and-swap advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Advanced(Cursor),
    Conflict,
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn read(&self, key: &WatchKey) -> Result<Option<Cursor>, AppError>;

    /// Move the cursor to `position`.
    ///
    /// `expected_generation = None` means "no cursor exists yet" and creates
    /// one at generation 1; it conflicts if a cursor already exists.
    async fn advance(
        &self,
        key: &WatchKey,
        expected_generation: Option<i64>,
        position: &CursorPosition,
    ) -> Result<Advance, AppError>;

    /// Drop the cursor of an unwatched channel. Returns whether one existed.
    async fn remove(&self, key: &WatchKey) -> Result<bool, AppError>;
}

/// PostgreSQL-backed cursor store.
#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn read(&self, key: &WatchKey) -> Result<Option<Cursor>, AppError> {
        let cursor: Option<Cursor> = sqlx::query_as(
            "SELECT * FROM watch_cursors WHERE guild_id = $1 AND channel_id = $2",
        )
        .bind(&key.guild_id)
        .bind(&key.channel_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor)
    }

    async fn advance(
        &self,
        key: &WatchKey,
        expected_generation: Option<i64>,
        position: &CursorPosition,
    ) -> Result<Advance, AppError> {
        let row: Option<Cursor> = match expected_generation {
            None => {
                sqlx::query_as(
                    r#"
                    INSERT INTO watch_cursors (guild_id, channel_id, item_id, published_at, generation)
                    VALUES ($1, $2, $3, $4, 1)
                    ON CONFLICT (guild_id, channel_id) DO NOTHING
                    RETURNING *
                    "#,
                )
                .bind(&key.guild_id)
                .bind(&key.channel_id)
                .bind(&position.item_id)
                .bind(position.published_at)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(generation) => {
                sqlx::query_as(
                    r#"
                    UPDATE watch_cursors
                    SET item_id = $3, published_at = $4, generation = generation + 1, updated_at = NOW()
                    WHERE guild_id = $1 AND channel_id = $2 AND generation = $5
                    RETURNING *
                    "#,
                )
                .bind(&key.guild_id)
                .bind(&key.channel_id)
                .bind(&position.item_id)
                .bind(position.published_at)
                .bind(generation)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(cursor) => {
                tracing::debug!(
                    watch = %key,
                    item_id = %cursor.item_id,
                    generation = cursor.generation,
                    "Cursor advanced"
                );
                Ok(Advance::Advanced(cursor))
            }
            None => {
                tracing::debug!(
                    watch = %key,
                    expected_generation = ?expected_generation,
                    "Cursor advance conflicted"
                );
                Ok(Advance::Conflict)
            }
        }
    }

    async fn remove(&self, key: &WatchKey) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM watch_cursors WHERE guild_id = $1 AND channel_id = $2")
            .bind(&key.guild_id)
            .bind(&key.channel_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// In-memory store backed by `HashMap`. No persistence.
#[derive(Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<WatchKey, Cursor>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn read(&self, key: &WatchKey) -> Result<Option<Cursor>, AppError> {
        let cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cursors.get(key).cloned())
    }

    async fn advance(
        &self,
        key: &WatchKey,
        expected_generation: Option<i64>,
        position: &CursorPosition,
    ) -> Result<Advance, AppError> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let stored = cursors.get(key).map(|c| c.generation);
        if stored != expected_generation {
            return Ok(Advance::Conflict);
        }

        let cursor = Cursor {
            guild_id: key.guild_id.clone(),
            channel_id: key.channel_id.clone(),
            item_id: position.item_id.clone(),
            published_at: position.published_at,
            generation: stored.map_or(1, |g| g + 1),
            updated_at: Utc::now(),
        };
        cursors.insert(key.clone(), cursor.clone());
        Ok(Advance::Advanced(cursor))
    }

    async fn remove(&self, key: &WatchKey) -> Result<bool, AppError> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cursors.remove(key).is_some())
    }
}
