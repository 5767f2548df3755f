//! Notification-event table operations

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::db::StoreError;
use crate::models::{EventFinalization, EventRow};
use crate::time;

/// Append an event row. A primary-key conflict surfaces as
/// [`StoreError::DuplicateEvent`].
pub async fn insert_event(pool: &SqlitePool, event: &EventRow) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_events (
            event_id, action_kind, action_time, card_id,
            board_id, board_name, list_id, list_name,
            list_before_id, list_before_name, list_after_id, list_after_name,
            is_list_transition, actor_id, actor_name, raw_payload,
            processed, processed_at, extraction_triggered, error_message, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.event_id)
    .bind(&event.action_kind)
    .bind(time::opt_to_db(event.action_time))
    .bind(&event.card_id)
    .bind(&event.board_id)
    .bind(&event.board_name)
    .bind(&event.list_id)
    .bind(&event.list_name)
    .bind(&event.list_before_id)
    .bind(&event.list_before_name)
    .bind(&event.list_after_id)
    .bind(&event.list_after_name)
    .bind(event.is_list_transition)
    .bind(&event.actor_id)
    .bind(&event.actor_name)
    .bind(&event.raw_payload)
    .bind(event.processed)
    .bind(time::opt_to_db(event.processed_at))
    .bind(event.extraction_triggered)
    .bind(&event.error_message)
    .bind(time::to_db(event.created_at))
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::DuplicateEvent(event.event_id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn event_exists(pool: &SqlitePool, event_id: &str) -> Result<bool, StoreError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM webhook_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Description carried by the most recent processed event for a card.
///
/// Fallback for cards that have no current row yet; reads strictly older
/// state than what the caller is about to write.
pub async fn last_processed_description(
    pool: &SqlitePool,
    card_id: &str,
) -> Result<Option<String>, StoreError> {
    let desc: Option<String> = sqlx::query_scalar(
        r#"
        SELECT json_extract(raw_payload, '$.action.data.card.desc')
        FROM webhook_events
        WHERE card_id = ?
          AND processed = 1
          AND json_extract(raw_payload, '$.action.data.card.desc') IS NOT NULL
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(card_id)
    .fetch_optional(pool)
    .await?;
    Ok(desc)
}

/// Apply terminal processing status to an event row.
pub async fn finalize_event(
    pool: &SqlitePool,
    finalization: &EventFinalization,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE webhook_events
        SET processed = 1,
            processed_at = ?,
            extraction_triggered = ?,
            error_message = ?
        WHERE event_id = ?
        "#,
    )
    .bind(time::to_db(time::now_ms()))
    .bind(finalization.extraction_triggered)
    .bind(&finalization.error_message)
    .bind(&finalization.event_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Unprocessed events older than the threshold with no open pending rows.
pub async fn stalled_events(
    pool: &SqlitePool,
    older_than: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<EventRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM webhook_events e
        WHERE e.processed = 0
          AND e.created_at < ?
          AND NOT EXISTS (
              SELECT 1 FROM pending_updates p
              WHERE p.event_id = e.event_id
                AND p.status IN ('pending', 'processing')
          )
        ORDER BY e.created_at ASC
        LIMIT ?
        "#,
    )
    .bind(time::to_db(older_than))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|row| row_to_event(&row)).collect()
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<EventRow, StoreError> {
    Ok(EventRow {
        event_id: row.get("event_id"),
        action_kind: row.get("action_kind"),
        action_time: time::opt_from_db(row.get("action_time"))?,
        card_id: row.get("card_id"),
        board_id: row.get("board_id"),
        board_name: row.get("board_name"),
        list_id: row.get("list_id"),
        list_name: row.get("list_name"),
        list_before_id: row.get("list_before_id"),
        list_before_name: row.get("list_before_name"),
        list_after_id: row.get("list_after_id"),
        list_after_name: row.get("list_after_name"),
        is_list_transition: row.get("is_list_transition"),
        actor_id: row.get("actor_id"),
        actor_name: row.get("actor_name"),
        raw_payload: row.get("raw_payload"),
        processed: row.get("processed"),
        processed_at: time::opt_from_db(row.get("processed_at"))?,
        extraction_triggered: row.get("extraction_triggered"),
        error_message: row.get("error_message"),
        created_at: time::from_db(&row.get::<String, _>("created_at"))?,
    })
}
