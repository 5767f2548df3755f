//! cardsink - webhook ingestion and state projection service
//!
//! Accepts change notifications from the source platform, records every
//! delivery in an append-only audit trail, and keeps the card and line-item
//! projections current, re-running LLM extraction only when a card's
//! description actually changed. A background retry worker re-applies store
//! writes the backend rejected transiently.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cardsink::api::OverflowLog;
use cardsink::config::Settings;
use cardsink::db::{self, RetryPolicy, SqliteStore, Store};
use cardsink::services::{BoardClient, Dispatcher, LlmExtractor, RetryWorker};
use cardsink::{build_router, AppState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting cardsink");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    let pool = db::init_store_pool(&settings.store.database_path).await?;
    info!("Store ready: {}", settings.store.database_path.display());

    let retry_policy = RetryPolicy {
        base_s: settings.retry.base_s,
        cap_s: settings.retry.cap_s,
        max_attempts: settings.retry.max_attempts,
    };
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool, retry_policy));
    let source = Arc::new(BoardClient::new(&settings.source)?);
    let extractor = Arc::new(LlmExtractor::new(&settings.extractor)?);

    let (intake_tx, intake_rx) = mpsc::channel(settings.pipeline.channel_capacity);
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), source, extractor));
    let worker_handles =
        dispatcher.spawn_workers(intake_rx, settings.pipeline.worker_concurrency);
    info!(
        concurrency = settings.pipeline.worker_concurrency,
        "Dispatcher pool started"
    );

    let retry_worker = Arc::new(RetryWorker::new(
        store.clone(),
        dispatcher.clone(),
        settings.retry.clone(),
    ));
    let retry_handle = retry_worker.spawn();

    let overflow = Arc::new(OverflowLog::new(settings.pipeline.overflow_log_path.clone()));
    let state = AppState::new(intake_tx, overflow);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr).await?;
    info!("Listening on http://{}", settings.server.bind_addr);
    info!("Callback URL: {}/webhook", settings.server.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping the router dropped the intake sender; give in-flight work a
    // bounded window to drain before exiting
    info!("Shutting down; draining dispatcher pool");
    retry_handle.abort();
    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        info!("Drain window elapsed; abandoning in-flight work for restart recovery");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
