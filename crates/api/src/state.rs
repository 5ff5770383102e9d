//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_engine::journal::NotificationJournal;
use herald_engine::watch::WatchService;
use herald_monitor::Scheduler;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub watches: Arc<WatchService>,
    pub journal: Arc<dyn NotificationJournal>,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(
        watches: Arc<WatchService>,
        journal: Arc<dyn NotificationJournal>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            watches,
            journal,
            scheduler,
        }
    }
}
