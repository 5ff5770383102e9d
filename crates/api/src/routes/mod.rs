pub mod channels;
pub mod health;
pub mod monitor;
pub mod notifications;
pub mod watches;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(watches::router())
        .merge(notifications::router())
        .merge(channels::router())
        .merge(monitor::router())
        .with_state(state)
}
