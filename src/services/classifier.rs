//! Change classification
//!
//! Extraction is the dominant cost of the pipeline, in both time and money.
//! Classification isolates the one boolean that controls whether it runs:
//! did the card's text meaningfully change?

use crate::models::{CurrentCard, SourceCard};

/// How a notification relates to known card state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    /// No master row yet: first observation of the card.
    New,
    /// Master row exists and the normalized description differs.
    DescChanged,
    /// Master row exists and the description is unchanged.
    MetadataOnly,
}

/// Normalize a description for comparison: CRLF/CR to LF, trimmed, absent
/// equivalent to empty.
pub fn normalize_description(desc: Option<&str>) -> String {
    desc.unwrap_or("")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

/// Whether an action warrants card processing at all. Only card creation and
/// card update carry state the projection tracks; everything else is recorded
/// and finalized without further work.
pub fn is_relevant(action_kind: &str, card_id: Option<&str>) -> bool {
    matches!(action_kind, "createCard" | "updateCard")
        && card_id.map_or(false, |id| !id.is_empty())
}

/// Classify a fetched card against the previously known description.
pub fn classify_update(
    has_master: bool,
    previous_desc: Option<&str>,
    new_desc: Option<&str>,
) -> ChangeClass {
    if !has_master {
        return ChangeClass::New;
    }
    if normalize_description(previous_desc) != normalize_description(new_desc) {
        ChangeClass::DescChanged
    } else {
        ChangeClass::MetadataOnly
    }
}

/// Fine-grained update subtype stamped on the current row as
/// `last_event_type`. Archive flips outrank description changes, which
/// outrank list moves and title edits.
pub fn update_subtype(
    desc_changed: bool,
    previous: Option<&CurrentCard>,
    card: &SourceCard,
) -> &'static str {
    if let Some(prev) = previous {
        if prev.row.closed != card.closed {
            return if card.closed {
                "updateCard:archived"
            } else {
                "updateCard:unarchived"
            };
        }
    }
    if desc_changed {
        return "updateCard:desc_changed";
    }
    if let Some(prev) = previous {
        if prev.row.list_id.as_deref() != card.id_list.as_deref() && card.id_list.is_some() {
            return "updateCard:list_moved";
        }
        if prev.row.name.as_deref() != card.name.as_deref() {
            return "updateCard:title_changed";
        }
    }
    "updateCard:other"
}
