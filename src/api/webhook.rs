//! Webhook intake
//!
//! One URL, two behaviors: HEAD/GET answer the platform's callback
//! verification with an empty 200, POST accepts a notification. The
//! acknowledgement is sent before any store write happens; parsed
//! notifications go to the dispatcher over a bounded channel. When the
//! channel is full the delivery is still acknowledged (the platform
//! retries, and idempotency absorbs the replay) but the arrival is
//! recorded in a local overflow log.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::get,
    Router,
};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::models::WebhookPayload;
use crate::services::Notification;
use crate::time;
use crate::AppState;

/// HEAD/GET callback verification probe.
pub async fn verify_callback() -> StatusCode {
    StatusCode::OK
}

/// POST notification intake.
///
/// 400 only for malformed payloads (bad JSON, missing action or card id);
/// internal trouble never escapes as non-2xx, or the platform would retry
/// and flood the queue.
pub async fn receive_notification(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON payload: {e}")))?;
    let payload: WebhookPayload = serde_json::from_value(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid notification payload: {e}")))?;

    if payload.action.id.is_empty() {
        return Err(ApiError::BadRequest("missing action id".to_string()));
    }
    if payload.action.card_id().is_none() {
        return Err(ApiError::BadRequest("missing card id".to_string()));
    }

    info!(
        event_id = %payload.action.id,
        action_kind = payload.action.kind.as_deref().unwrap_or(""),
        card_id = payload.action.card_id().unwrap_or(""),
        board_id = payload
            .action
            .data
            .board
            .as_ref()
            .map(|b| b.id.as_str())
            .unwrap_or(""),
        list_transition = payload.action.is_list_transition(),
        "Notification received"
    );

    let notification = Notification {
        action: payload.action,
        raw_payload: String::from_utf8_lossy(&body).into_owned(),
        received_at: time::now_ms(),
    };

    match state.intake_tx.try_send(notification) {
        Ok(()) => {}
        Err(TrySendError::Full(n)) => {
            warn!(event_id = %n.action.id, "Dispatch channel full; recording overflow");
            state.overflow.record(&n);
        }
        Err(TrySendError::Closed(n)) => {
            error!(event_id = %n.action.id, "Dispatch channel closed; recording overflow");
            state.overflow.record(&n);
        }
    }

    Ok(StatusCode::OK)
}

/// Append-only record of deliveries the channel could not absorb. The
/// platform's own retry plus event idempotency bounds the loss to nothing.
pub struct OverflowLog {
    path: PathBuf,
}

impl OverflowLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn record(&self, notification: &Notification) {
        let line = json!({
            "event_id": notification.action.id,
            "action_kind": notification.action.kind,
            "card_id": notification.action.card_id(),
            "received_at": time::to_db(notification.received_at),
        });
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            error!(error = %e, path = %self.path.display(), "Overflow log write failed");
        }
    }
}

/// Intake routes: one URL, liveness on GET/HEAD, notifications on POST.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route(
        "/webhook",
        get(verify_callback).post(receive_notification),
    )
}
