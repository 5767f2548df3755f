//! Retry-queue rows for deferred store operations
//!
//! A pending update captures exactly one store write that was rejected
//! transiently, with everything required to re-attempt it. The payload also
//! carries the event finalization to apply once the event's last open
//! operation completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::card::{CardRow, CurrentStamp};
use crate::models::event::EventFinalization;
use crate::models::line_item::LineItemRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    UpsertCard,
    ReplaceLineItems,
    FinalizeEvent,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::UpsertCard => "upsert_card",
            OperationKind::ReplaceLineItems => "replace_line_items",
            OperationKind::FinalizeEvent => "finalize_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert_card" => Some(OperationKind::UpsertCard),
            "replace_line_items" => Some(OperationKind::ReplaceLineItems),
            "finalize_event" => Some(OperationKind::FinalizeEvent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Processing => "processing",
            PendingStatus::Completed => "completed",
            PendingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PendingStatus::Pending),
            "processing" => Some(PendingStatus::Processing),
            "completed" => Some(PendingStatus::Completed),
            "failed" => Some(PendingStatus::Failed),
            _ => None,
        }
    }
}

/// Typed payload blob stored on a pending row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PendingPayload {
    UpsertCard {
        row: CardRow,
        stamp: CurrentStamp,
        finalize: EventFinalization,
    },
    ReplaceLineItems {
        card_id: String,
        rows: Vec<LineItemRow>,
        finalize: EventFinalization,
    },
    FinalizeEvent {
        finalize: EventFinalization,
    },
}

impl PendingPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            PendingPayload::UpsertCard { .. } => OperationKind::UpsertCard,
            PendingPayload::ReplaceLineItems { .. } => OperationKind::ReplaceLineItems,
            PendingPayload::FinalizeEvent { .. } => OperationKind::FinalizeEvent,
        }
    }

    pub fn target_table(&self) -> &'static str {
        match self {
            PendingPayload::UpsertCard { .. } => "cards_current",
            PendingPayload::ReplaceLineItems { .. } => "line_items_current",
            PendingPayload::FinalizeEvent { .. } => "webhook_events",
        }
    }

    pub fn finalization(&self) -> &EventFinalization {
        match self {
            PendingPayload::UpsertCard { finalize, .. } => finalize,
            PendingPayload::ReplaceLineItems { finalize, .. } => finalize,
            PendingPayload::FinalizeEvent { finalize } => finalize,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.finalization().event_id
    }
}

/// One row of the retry queue as read back from the store.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub update_id: String,
    pub operation_kind: OperationKind,
    pub target_table: String,
    pub event_id: String,
    pub payload: String,
    pub retry_count: i64,
    pub first_queued_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    pub status: PendingStatus,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one retry attempt, applied by `complete_pending`.
#[derive(Debug, Clone)]
pub enum PendingOutcome {
    /// Attempt succeeded.
    Completed,
    /// Attempt failed transiently; requeue with backoff (or fail once the
    /// retry budget is exhausted).
    Retry { error: String },
    /// Attempt failed permanently.
    Failed { error: String },
}
