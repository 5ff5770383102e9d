//! Channel lookup against the provider's catalogue.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::ChannelIdentity;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/channels/lookup", get(lookup_channel))
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    handle: Option<String>,
}

/// GET /api/channels/lookup?handle=: Resolve a name or @handle to a channel.
///
/// Pure lookup; nothing is stored.
async fn lookup_channel(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<ChannelIdentity>, AppError> {
    let identity = state
        .watches
        .find_channel_by_handle(query.handle.as_deref().unwrap_or_default())
        .await?;
    Ok(Json(identity))
}
