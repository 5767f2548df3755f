//! Wire types for notifications pushed by the source platform
//!
//! The platform delivers one JSON document per user-observable change. Only
//! the fields the pipeline consumes are modeled; everything else rides along
//! in the verbatim raw payload stored on the events table.

use serde::{Deserialize, Serialize};

/// Top-level webhook delivery: the action plus the subscribed model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<serde_json::Value>,
}

/// One action on a board: card created/updated/commented/moved/etc.
///
/// `id` is unique across all deliveries and serves as the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    pub data: ActionData,
    #[serde(rename = "memberCreator", default)]
    pub member_creator: Option<MemberRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default)]
    pub board: Option<BoardRef>,
    #[serde(default)]
    pub card: Option<CardRef>,
    #[serde(default)]
    pub list: Option<ListRef>,
    #[serde(rename = "listBefore", default)]
    pub list_before: Option<ListRef>,
    #[serde(rename = "listAfter", default)]
    pub list_after: Option<ListRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(rename = "idList", default)]
    pub id_list: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "fullName", default)]
    pub full_name: Option<String>,
}

impl Action {
    /// Whether this action moved the card between lists: both the before and
    /// after list must be present and carry different ids.
    pub fn is_list_transition(&self) -> bool {
        match (&self.data.list_before, &self.data.list_after) {
            (Some(before), Some(after)) => before.id != after.id,
            _ => false,
        }
    }

    /// Card id carried by the action, if any.
    pub fn card_id(&self) -> Option<&str> {
        self.data
            .card
            .as_ref()
            .map(|c| c.id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// The list the card sits in after this action.
    ///
    /// Prefers `listAfter` (transitions), then `list`, then the card's own
    /// list id (which carries no name).
    pub fn current_list(&self) -> (Option<String>, Option<String>) {
        if let Some(after) = &self.data.list_after {
            return (Some(after.id.clone()), after.name.clone());
        }
        if let Some(list) = &self.data.list {
            return (Some(list.id.clone()), list.name.clone());
        }
        if let Some(card) = &self.data.card {
            return (card.id_list.clone(), None);
        }
        (None, None)
    }
}
