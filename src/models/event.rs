//! Notification event rows (append-only audit trail)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::webhook::Action;

/// One row in the events table. Created once at intake; the processing-status
/// fields are updated at most twice (success or terminal failure) and rows
/// are never deleted.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_id: String,
    pub action_kind: String,
    pub action_time: Option<DateTime<Utc>>,
    pub card_id: String,
    pub board_id: Option<String>,
    pub board_name: Option<String>,
    pub list_id: Option<String>,
    pub list_name: Option<String>,
    pub list_before_id: Option<String>,
    pub list_before_name: Option<String>,
    pub list_after_id: Option<String>,
    pub list_after_name: Option<String>,
    pub is_list_transition: bool,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
    /// Verbatim delivery body, kept opaque for reprocessing.
    pub raw_payload: String,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub extraction_triggered: Option<bool>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventRow {
    /// Build the intake-time row for an action. Processing-status fields
    /// start unset.
    pub fn from_action(action: &Action, raw_payload: String, now: DateTime<Utc>) -> Self {
        let (list_id, list_name) = action.current_list();
        let before = action.data.list_before.as_ref();
        let after = action.data.list_after.as_ref();
        let actor = action.member_creator.as_ref();
        Self {
            event_id: action.id.clone(),
            action_kind: action.kind.clone().unwrap_or_default(),
            action_time: action
                .date
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc)),
            card_id: action.card_id().unwrap_or_default().to_string(),
            board_id: action.data.board.as_ref().map(|b| b.id.clone()),
            board_name: action.data.board.as_ref().and_then(|b| b.name.clone()),
            list_id,
            list_name,
            list_before_id: before.map(|l| l.id.clone()),
            list_before_name: before.and_then(|l| l.name.clone()),
            list_after_id: after.map(|l| l.id.clone()),
            list_after_name: after.and_then(|l| l.name.clone()),
            is_list_transition: action.is_list_transition(),
            actor_id: actor.map(|m| m.id.clone()),
            actor_name: actor.and_then(|m| m.username.clone()),
            raw_payload,
            processed: false,
            processed_at: None,
            extraction_triggered: None,
            error_message: None,
            created_at: now,
        }
    }
}

/// Terminal processing status applied to an event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFinalization {
    pub event_id: String,
    pub success: bool,
    pub extraction_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EventFinalization {
    pub fn success(event_id: &str, extraction_triggered: bool) -> Self {
        Self {
            event_id: event_id.to_string(),
            success: true,
            extraction_triggered,
            error_message: None,
        }
    }

    pub fn failure(event_id: &str, extraction_triggered: bool, error: impl Into<String>) -> Self {
        Self {
            event_id: event_id.to_string(),
            success: false,
            extraction_triggered,
            error_message: Some(error.into()),
        }
    }
}
