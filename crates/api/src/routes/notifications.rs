//! Notification journal routes.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::NotificationLog;
use herald_engine::journal::log_limit;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/guilds/{guild_id}/notifications",
        get(recent_notifications),
    )
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<i64>,
}

/// GET /api/guilds/:guild_id/notifications?limit=: Latest notifications, newest first.
async fn recent_notifications(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<NotificationLog>>, AppError> {
    let limit = log_limit(query.limit)?;
    let logs = state.journal.recent_for_guild(&guild_id, limit).await?;
    Ok(Json(logs))
}
