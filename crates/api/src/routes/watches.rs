//! Watch routes: list, add and remove watches of a guild, and check one now.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::{WatchKey, WatchedChannel};
use herald_engine::dedup::PassReport;
use herald_engine::watch::AddWatchParams;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/guilds/{guild_id}/watches", get(list_watches))
        .route("/api/guilds/{guild_id}/watches", post(add_watch))
        .route(
            "/api/guilds/{guild_id}/watches/{channel_id}",
            delete(remove_watch),
        )
        .route(
            "/api/guilds/{guild_id}/watches/{channel_id}/check",
            post(check_now),
        )
}

/// GET /api/guilds/:guild_id/watches: Every watch of a guild, suspended ones included.
async fn list_watches(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
) -> Result<Json<Vec<WatchedChannel>>, AppError> {
    let watches = state.watches.list_for_guild(&guild_id).await?;
    Ok(Json(watches))
}

/// POST /api/guilds/:guild_id/watches: Add or reconfigure a watch.
///
/// The watch is scheduled right away; its first check records a baseline and
/// sends nothing.
async fn add_watch(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    Json(params): Json<AddWatchParams>,
) -> Result<Json<WatchedChannel>, AppError> {
    let watch = state.watches.add_watch(&guild_id, &params).await?;
    state.scheduler.refresh().await;
    Ok(Json(watch))
}

/// DELETE /api/guilds/:guild_id/watches/:channel_id: Remove a watch and its cursor.
async fn remove_watch(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.watches.remove_watch(&guild_id, &channel_id).await?;
    if removed {
        state.scheduler.refresh().await;
        Ok(Json(serde_json::json!({"deleted": true})))
    } else {
        Err(AppError::NotFound(format!(
            "Watch {} not found",
            WatchKey::new(guild_id, channel_id)
        )))
    }
}

/// POST /api/guilds/:guild_id/watches/:channel_id/check: Run a check now.
///
/// Returns the items dispatched by this check.
async fn check_now(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(String, String)>,
) -> Result<Json<PassReport>, AppError> {
    let key = WatchKey::new(guild_id, channel_id);
    let report = state.scheduler.check_now(&key).await?;
    Ok(Json(report))
}
