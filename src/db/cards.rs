//! Card master and current-projection table operations

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::db::{MasterInsert, StoreError};
use crate::models::card::CreatedDates;
use crate::models::{CardRow, CurrentCard, CurrentStamp};
use crate::time;

pub async fn exists_in_master(pool: &SqlitePool, card_id: &str) -> Result<bool, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cards_master WHERE card_id = ?")
        .bind(card_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn current_description(
    pool: &SqlitePool,
    card_id: &str,
) -> Result<Option<String>, StoreError> {
    let row = sqlx::query(r#"SELECT "desc" FROM cards_current WHERE card_id = ?"#)
        .bind(card_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<Option<String>, _>("desc").unwrap_or_default()))
}

/// Insert the first-observation snapshot. Rows are immutable once written;
/// a later insert for the same card is a no-op.
pub async fn insert_master_if_absent(
    pool: &SqlitePool,
    row: &CardRow,
    first_extracted_at: DateTime<Utc>,
    first_extraction_event_id: &str,
) -> Result<MasterInsert, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO cards_master (
            card_id, name, "desc", labels, closed, date_last_activity,
            purchaser, order_summary, primary_buyer_name, primary_buyer_email,
            date_created, datetime_created, year_created, month_created, year_month,
            unix_timestamp, line_item_count, list_id, list_name, board_id, board_name,
            first_extracted_at, first_extraction_event_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.card_id)
    .bind(&row.name)
    .bind(&row.desc)
    .bind(&row.labels)
    .bind(row.closed)
    .bind(&row.date_last_activity)
    .bind(&row.purchaser)
    .bind(&row.order_summary)
    .bind(&row.primary_buyer_name)
    .bind(&row.primary_buyer_email)
    .bind(&row.created.date_created)
    .bind(&row.created.datetime_created)
    .bind(row.created.year_created)
    .bind(row.created.month_created)
    .bind(&row.created.year_month)
    .bind(row.created.unix_timestamp)
    .bind(row.line_item_count)
    .bind(&row.list_id)
    .bind(&row.list_name)
    .bind(&row.board_id)
    .bind(&row.board_name)
    .bind(time::to_db(first_extracted_at))
    .bind(first_extraction_event_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        Ok(MasterInsert::Inserted)
    } else {
        Ok(MasterInsert::AlreadyPresent)
    }
}

/// Replace the current projection row for a card.
///
/// `last_extracted_at` and `last_extraction_event_id` coalesce with the
/// existing row, so a metadata-only refresh leaves extraction provenance
/// untouched.
pub async fn upsert_current(
    pool: &SqlitePool,
    row: &CardRow,
    stamp: &CurrentStamp,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO cards_current (
            card_id, name, "desc", labels, closed, date_last_activity,
            purchaser, order_summary, primary_buyer_name, primary_buyer_email,
            date_created, datetime_created, year_created, month_created, year_month,
            unix_timestamp, line_item_count, list_id, list_name, board_id, board_name,
            last_updated_at, last_extracted_at, last_extraction_event_id, last_event_type
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(card_id) DO UPDATE SET
            name = excluded.name,
            "desc" = excluded."desc",
            labels = excluded.labels,
            closed = excluded.closed,
            date_last_activity = excluded.date_last_activity,
            purchaser = excluded.purchaser,
            order_summary = excluded.order_summary,
            primary_buyer_name = excluded.primary_buyer_name,
            primary_buyer_email = excluded.primary_buyer_email,
            date_created = excluded.date_created,
            datetime_created = excluded.datetime_created,
            year_created = excluded.year_created,
            month_created = excluded.month_created,
            year_month = excluded.year_month,
            unix_timestamp = excluded.unix_timestamp,
            line_item_count = excluded.line_item_count,
            list_id = excluded.list_id,
            list_name = excluded.list_name,
            board_id = excluded.board_id,
            board_name = excluded.board_name,
            last_updated_at = excluded.last_updated_at,
            last_extracted_at = COALESCE(excluded.last_extracted_at, cards_current.last_extracted_at),
            last_extraction_event_id = COALESCE(excluded.last_extraction_event_id, cards_current.last_extraction_event_id),
            last_event_type = COALESCE(excluded.last_event_type, cards_current.last_event_type)
        "#,
    )
    .bind(&row.card_id)
    .bind(&row.name)
    .bind(&row.desc)
    .bind(&row.labels)
    .bind(row.closed)
    .bind(&row.date_last_activity)
    .bind(&row.purchaser)
    .bind(&row.order_summary)
    .bind(&row.primary_buyer_name)
    .bind(&row.primary_buyer_email)
    .bind(&row.created.date_created)
    .bind(&row.created.datetime_created)
    .bind(row.created.year_created)
    .bind(row.created.month_created)
    .bind(&row.created.year_month)
    .bind(row.created.unix_timestamp)
    .bind(row.line_item_count)
    .bind(&row.list_id)
    .bind(&row.list_name)
    .bind(&row.board_id)
    .bind(&row.board_name)
    .bind(time::to_db(stamp.last_updated_at))
    .bind(time::opt_to_db(stamp.last_extracted_at))
    .bind(&stamp.last_extraction_event_id)
    .bind(&stamp.last_event_type)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_current(
    pool: &SqlitePool,
    card_id: &str,
) -> Result<Option<CurrentCard>, StoreError> {
    let row = sqlx::query("SELECT * FROM cards_current WHERE card_id = ?")
        .bind(card_id)
        .fetch_optional(pool)
        .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let card = CardRow {
        card_id: row.get("card_id"),
        name: row.get("name"),
        desc: row.get("desc"),
        labels: row.get("labels"),
        closed: row.get("closed"),
        date_last_activity: row.get("date_last_activity"),
        purchaser: row.get("purchaser"),
        order_summary: row.get("order_summary"),
        primary_buyer_name: row.get("primary_buyer_name"),
        primary_buyer_email: row.get("primary_buyer_email"),
        created: CreatedDates {
            date_created: row.get("date_created"),
            datetime_created: row.get("datetime_created"),
            year_created: row.get("year_created"),
            month_created: row.get("month_created"),
            year_month: row.get("year_month"),
            unix_timestamp: row.get("unix_timestamp"),
        },
        line_item_count: row.get("line_item_count"),
        list_id: row.get("list_id"),
        list_name: row.get("list_name"),
        board_id: row.get("board_id"),
        board_name: row.get("board_name"),
    };

    Ok(Some(CurrentCard {
        row: card,
        last_updated_at: time::from_db(&row.get::<String, _>("last_updated_at"))?,
        last_extracted_at: time::opt_from_db(row.get("last_extracted_at"))?,
        last_extraction_event_id: row.get("last_extraction_event_id"),
        last_event_type: row.get("last_event_type"),
    }))
}
