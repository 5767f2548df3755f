//! cardsink library interface
//!
//! Ingests change notifications from a collaboration-board platform and
//! maintains a derived analytical store: an append-only audit trail of every
//! notification plus a continuously updated current-state projection of each
//! card and its LLM-priced line items.
//!
//! Exposed as a library so integration tests can exercise the router and
//! pipeline directly.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod time;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::OverflowLog;
use crate::services::Notification;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Bounded channel into the dispatcher pool
    pub intake_tx: mpsc::Sender<Notification>,
    /// Overflow record for deliveries the channel could not absorb
    pub overflow: Arc<OverflowLog>,
    /// Service start time, for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(intake_tx: mpsc::Sender<Notification>, overflow: Arc<OverflowLog>) -> Self {
        Self {
            intake_tx,
            overflow,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::webhook_routes())
        .merge(api::health_routes())
        .with_state(state)
}
