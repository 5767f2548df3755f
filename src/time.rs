//! Timestamp utilities
//!
//! All persisted timestamps are absolute UTC with millisecond resolution,
//! stored as RFC 3339 TEXT.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};

/// Current UTC timestamp, truncated to millisecond resolution.
pub fn now_ms() -> DateTime<Utc> {
    truncate_ms(Utc::now())
}

/// Truncate a timestamp to millisecond resolution.
pub fn truncate_ms(dt: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = dt.nanosecond();
    dt.with_nanosecond(nanos - nanos % 1_000_000).unwrap_or(dt)
}

/// Format a timestamp for storage.
pub fn to_db(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format an optional timestamp for storage.
pub fn opt_to_db(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(to_db)
}

/// Parse a stored timestamp.
pub fn from_db(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Parse an optional stored timestamp.
pub fn opt_from_db(s: Option<String>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    s.as_deref().map(from_db).transpose()
}
