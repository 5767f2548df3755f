//! Table bootstrap for the five analytical tables
//!
//! The events table is indexed by card id, action kind, and the
//! list-transition flag plus ingest date; the retry queue by status,
//! next-retry time, and operation kind.

use sqlx::SqlitePool;

use crate::db::StoreError;

const CREATE_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        event_id TEXT PRIMARY KEY,
        action_kind TEXT NOT NULL,
        action_time TEXT,
        card_id TEXT NOT NULL,
        board_id TEXT,
        board_name TEXT,
        list_id TEXT,
        list_name TEXT,
        list_before_id TEXT,
        list_before_name TEXT,
        list_after_id TEXT,
        list_after_name TEXT,
        is_list_transition INTEGER NOT NULL DEFAULT 0,
        actor_id TEXT,
        actor_name TEXT,
        raw_payload TEXT NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        processed_at TEXT,
        extraction_triggered INTEGER,
        error_message TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_card ON webhook_events(card_id, action_kind, is_list_transition)",
    "CREATE INDEX IF NOT EXISTS idx_events_created ON webhook_events(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_unprocessed ON webhook_events(processed, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS cards_master (
        card_id TEXT PRIMARY KEY,
        name TEXT,
        "desc" TEXT,
        labels TEXT,
        closed INTEGER NOT NULL DEFAULT 0,
        date_last_activity TEXT,
        purchaser TEXT,
        order_summary TEXT,
        primary_buyer_name TEXT,
        primary_buyer_email TEXT,
        date_created TEXT,
        datetime_created TEXT,
        year_created INTEGER,
        month_created INTEGER,
        year_month TEXT,
        unix_timestamp INTEGER,
        line_item_count INTEGER NOT NULL DEFAULT 0,
        list_id TEXT,
        list_name TEXT,
        board_id TEXT,
        board_name TEXT,
        first_extracted_at TEXT,
        first_extraction_event_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cards_current (
        card_id TEXT PRIMARY KEY,
        name TEXT,
        "desc" TEXT,
        labels TEXT,
        closed INTEGER NOT NULL DEFAULT 0,
        date_last_activity TEXT,
        purchaser TEXT,
        order_summary TEXT,
        primary_buyer_name TEXT,
        primary_buyer_email TEXT,
        date_created TEXT,
        datetime_created TEXT,
        year_created INTEGER,
        month_created INTEGER,
        year_month TEXT,
        unix_timestamp INTEGER,
        line_item_count INTEGER NOT NULL DEFAULT 0,
        list_id TEXT,
        list_name TEXT,
        board_id TEXT,
        board_name TEXT,
        last_updated_at TEXT NOT NULL,
        last_extracted_at TEXT,
        last_extraction_event_id TEXT,
        last_event_type TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS line_items_master (
        card_id TEXT NOT NULL,
        line_index INTEGER NOT NULL,
        quantity INTEGER NOT NULL DEFAULT 1,
        raw_price REAL,
        price_kind TEXT NOT NULL DEFAULT 'total',
        unit_price REAL,
        total_revenue REAL,
        description TEXT,
        business_line TEXT,
        material TEXT,
        dimensions TEXT,
        PRIMARY KEY (card_id, line_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS line_items_current (
        card_id TEXT NOT NULL,
        line_index INTEGER NOT NULL,
        quantity INTEGER NOT NULL DEFAULT 1,
        raw_price REAL,
        price_kind TEXT NOT NULL DEFAULT 'total',
        unit_price REAL,
        total_revenue REAL,
        description TEXT,
        business_line TEXT,
        material TEXT,
        dimensions TEXT,
        PRIMARY KEY (card_id, line_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pending_updates (
        update_id TEXT PRIMARY KEY,
        operation_kind TEXT NOT NULL,
        target_table TEXT NOT NULL,
        event_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        first_queued_at TEXT NOT NULL,
        last_retry_at TEXT,
        next_retry_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        completed_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pending_due ON pending_updates(status, next_retry_at, operation_kind)",
    "CREATE INDEX IF NOT EXISTS idx_pending_event ON pending_updates(event_id, status)",
];

/// Create the five tables and their indexes if missing.
pub async fn create_tables(pool: &SqlitePool) -> Result<(), StoreError> {
    for stmt in CREATE_STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    tracing::info!(
        "Store tables ready (webhook_events, cards_master, cards_current, line_items_master, line_items_current, pending_updates)"
    );
    Ok(())
}
