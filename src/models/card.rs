//! Card rows and the pure derivations that populate them

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::webhook::Action;
use crate::services::extractor::CardFields;

/// Card as fetched from the source platform with full field projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCard {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(rename = "idList", default)]
    pub id_list: Option<String>,
    #[serde(rename = "idBoard", default)]
    pub id_board: Option<String>,
    #[serde(rename = "dateLastActivity", default)]
    pub date_last_activity: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub name: Option<String>,
}

/// Creation-time fields derived from the card id.
///
/// The first 8 hex characters of a card id encode the Unix timestamp of card
/// creation. Ids that are too short or not hex yield all-absent fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatedDates {
    pub date_created: Option<String>,
    pub datetime_created: Option<String>,
    pub year_created: Option<i32>,
    pub month_created: Option<u32>,
    pub year_month: Option<String>,
    pub unix_timestamp: Option<i64>,
}

pub fn derive_created_dates(card_id: &str) -> CreatedDates {
    let prefix = match card_id.get(..8) {
        Some(p) if p.bytes().all(|b| b.is_ascii_hexdigit()) => p,
        _ => return CreatedDates::default(),
    };
    let unix = match i64::from_str_radix(prefix, 16) {
        Ok(v) => v,
        Err(_) => return CreatedDates::default(),
    };
    let dt: DateTime<Utc> = match Utc.timestamp_opt(unix, 0).single() {
        Some(dt) => dt,
        None => return CreatedDates::default(),
    };
    CreatedDates {
        date_created: Some(dt.format("%Y-%m-%d").to_string()),
        datetime_created: Some(dt.to_rfc3339()),
        year_created: Some(dt.year()),
        month_created: Some(dt.month()),
        year_month: Some(dt.format("%Y-%m").to_string()),
        unix_timestamp: Some(unix),
    }
}

/// Split a card title into purchaser and order summary on the first `|`.
pub fn parse_title_fields(name: &str) -> (Option<String>, Option<String>) {
    if !name.contains('|') {
        return (None, None);
    }
    let mut parts = name.splitn(2, '|').map(str::trim);
    let purchaser = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
    let summary = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
    (purchaser, summary)
}

/// Flatten label objects into a comma-separated string.
pub fn flatten_labels(labels: &[Label]) -> Option<String> {
    let names: Vec<&str> = labels
        .iter()
        .filter_map(|l| l.name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// Columns shared by the master and current card tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRow {
    pub card_id: String,
    pub name: Option<String>,
    pub desc: Option<String>,
    pub labels: Option<String>,
    pub closed: bool,
    pub date_last_activity: Option<String>,
    pub purchaser: Option<String>,
    pub order_summary: Option<String>,
    pub primary_buyer_name: Option<String>,
    pub primary_buyer_email: Option<String>,
    #[serde(flatten)]
    pub created: CreatedDates,
    pub line_item_count: i64,
    pub list_id: Option<String>,
    pub list_name: Option<String>,
    pub board_id: Option<String>,
    pub board_name: Option<String>,
}

impl CardRow {
    /// Compose a row from a fetched card, the triggering action's board/list
    /// identity, and extracted fields.
    pub fn compose(
        card: &SourceCard,
        action: &Action,
        fields: &CardFields,
        line_item_count: i64,
    ) -> Self {
        let (purchaser, order_summary) = match card.name.as_deref() {
            Some(name) => parse_title_fields(name),
            None => (None, None),
        };
        let (list_id, list_name) = action.current_list();
        let board = action.data.board.as_ref();
        Self {
            card_id: card.id.clone(),
            name: card.name.clone(),
            desc: card.desc.clone(),
            labels: flatten_labels(&card.labels),
            closed: card.closed,
            date_last_activity: card.date_last_activity.clone(),
            purchaser,
            order_summary,
            primary_buyer_name: fields.primary_buyer_name.clone(),
            primary_buyer_email: fields.primary_buyer_email.clone(),
            created: derive_created_dates(&card.id),
            line_item_count,
            list_id: list_id.or_else(|| card.id_list.clone()),
            list_name,
            board_id: board
                .map(|b| b.id.clone())
                .or_else(|| card.id_board.clone()),
            board_name: board.and_then(|b| b.name.clone()),
        }
    }
}

/// Projection bookkeeping stamped onto the current row at upsert time.
///
/// `last_extracted_at` and `last_extraction_event_id` left as `None` preserve
/// whatever the current row already holds; the store coalesces them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStamp {
    pub last_updated_at: DateTime<Utc>,
    pub last_extracted_at: Option<DateTime<Utc>>,
    pub last_extraction_event_id: Option<String>,
    pub last_event_type: Option<String>,
}

/// A current-table row as read back from the store.
#[derive(Debug, Clone)]
pub struct CurrentCard {
    pub row: CardRow,
    pub last_updated_at: DateTime<Utc>,
    pub last_extracted_at: Option<DateTime<Utc>>,
    pub last_extraction_event_id: Option<String>,
    pub last_event_type: Option<String>,
}
