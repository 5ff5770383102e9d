//! Scheduler observability.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use herald_common::types::CheckAttempt;
use herald_notifier::DispatchStats;

use crate::state::AppState;

const DEFAULT_ATTEMPTS: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/monitor/attempts", get(recent_attempts))
}

#[derive(Debug, Deserialize)]
struct AttemptQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AttemptsResponse {
    attempts: Vec<CheckAttempt>,
    dispatch: DispatchStats,
}

/// GET /api/monitor/attempts?limit=: Recent check attempts, newest first,
/// plus dispatch counters since startup.
async fn recent_attempts(
    State(state): State<AppState>,
    Query(query): Query<AttemptQuery>,
) -> Json<AttemptsResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_ATTEMPTS);
    Json(AttemptsResponse {
        attempts: state.scheduler.recent_attempts(limit),
        dispatch: state.scheduler.checker().engine().notifier().stats(),
    })
}
