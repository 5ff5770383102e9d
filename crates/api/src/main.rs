//! Herald server binary: runs the check scheduler and the HTTP API in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{create_pool, migrate};
use herald_common::redis_pool::create_redis_pool;
use herald_engine::cursor::{CursorStore, PgCursorStore};
use herald_engine::dedup::DedupEngine;
use herald_engine::journal::{NotificationJournal, PgJournal};
use herald_engine::watch::{PgWatchStore, WatchService, WatchStore};
use herald_feed::youtube::YouTubeClient;
use herald_monitor::{Checker, LocalQuota, QuotaBudget, RedisQuota, Scheduler, SchedulerConfig};
use herald_notifier::{DiscordTarget, Notifier};

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "herald_api=info,herald_monitor=info,herald_engine=info,herald_notifier=info,tower_http=info",
            )
        }))
        .init();

    tracing::info!("Starting Herald...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config).await?;
    migrate(&pool).await?;

    // Shared quota when several processes use one provider key.
    let quota: Arc<dyn QuotaBudget> = match &config.redis_url {
        Some(url) => {
            let redis = create_redis_pool(url).await?;
            Arc::new(RedisQuota::new(
                redis,
                config.quota_max_calls,
                config.quota_window(),
            ))
        }
        None => {
            tracing::info!("REDIS_URL not set, keeping the quota budget in-process");
            Arc::new(LocalQuota::new(
                config.quota_max_calls,
                config.quota_window(),
            ))
        }
    };

    let youtube = Arc::new(YouTubeClient::new(
        config.youtube_api_key.clone(),
        config.youtube_api_base_url.clone(),
        config.feed_page_size,
    )?);
    let target = Arc::new(DiscordTarget::new(
        config.discord_api_base_url.clone(),
        config.discord_bot_token.clone(),
    )?);

    let cursors: Arc<dyn CursorStore> = Arc::new(PgCursorStore::new(pool.clone()));
    let watch_store: Arc<dyn WatchStore> = Arc::new(PgWatchStore::new(pool.clone()));
    let journal: Arc<dyn NotificationJournal> = Arc::new(PgJournal::new(pool.clone()));

    let engine = Arc::new(DedupEngine::new(
        Arc::clone(&cursors),
        Arc::new(Notifier::new(target)),
        Arc::clone(&journal),
    ));
    let checker = Checker::new(youtube.clone(), engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        Arc::clone(&watch_store),
        checker,
        quota,
        SchedulerConfig::from_app(&config),
        shutdown_rx,
    );
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let watches = Arc::new(WatchService::new(watch_store, cursors, youtube));
    let state = AppState::new(watches, journal, scheduler);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // In-flight checks finish their current dispatch and cursor write.
    scheduler_task.await?;
    tracing::info!("Herald stopped");

    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
}
