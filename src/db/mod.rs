//! Store adapter for the analytical tables
//!
//! Translates the pipeline's logical operations into statements against the
//! backing store and classifies failures: transient write rejections surface
//! as [`StoreError::Deferred`] and are queued for retry, everything else is
//! permanent.
//!
//! The `Store` trait is the seam the dispatcher and retry worker depend on;
//! [`SqliteStore`] is the production implementation.

pub mod cards;
pub mod events;
pub mod line_items;
pub mod pending;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use thiserror::Error;

use crate::models::{
    CardRow, CurrentCard, CurrentStamp, EventFinalization, EventRow, LineItemRow, PendingOutcome,
    PendingPayload, PendingUpdate,
};

/// Store failure classification.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The event id is already recorded.
    #[error("duplicate event {0}")]
    DuplicateEvent(String),

    /// The store rejected the write transiently; queue it and retry later.
    #[error("store deferred the write: {0}")]
    Deferred(String),

    /// Anything that will not succeed on retry.
    #[error("store error: {0}")]
    Permanent(String),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let msg = db.message().to_ascii_lowercase();
            if msg.contains("database is locked") || msg.contains("database is busy") {
                return StoreError::Deferred(db.message().to_string());
            }
        }
        StoreError::Permanent(e.to_string())
    }
}

impl From<chrono::ParseError> for StoreError {
    fn from(e: chrono::ParseError) -> Self {
        StoreError::Permanent(format!("stored timestamp unreadable: {e}"))
    }
}

/// Result of a conditional master insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterInsert {
    Inserted,
    AlreadyPresent,
}

/// Backoff and retry-budget parameters for the pending-updates queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_s: i64,
    pub cap_s: i64,
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_s: 60,
            cap_s: 3600,
            max_attempts: 10,
        }
    }
}

/// Logical operations the pipeline performs against the analytical store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a notification event. Fails with [`StoreError::DuplicateEvent`]
    /// if the event id is already recorded.
    async fn insert_event(&self, event: &EventRow) -> Result<(), StoreError>;

    async fn event_exists(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Last known description for a card: the current row when present,
    /// otherwise the most recent processed event that carried one.
    async fn last_known_description(&self, card_id: &str) -> Result<Option<String>, StoreError>;

    async fn card_in_master(&self, card_id: &str) -> Result<bool, StoreError>;

    /// Insert the first-observation snapshot; never overwrites.
    async fn insert_card_master_if_absent(
        &self,
        row: &CardRow,
        first_extracted_at: DateTime<Utc>,
        first_extraction_event_id: &str,
    ) -> Result<MasterInsert, StoreError>;

    async fn get_card_current(&self, card_id: &str) -> Result<Option<CurrentCard>, StoreError>;

    /// Replace the current projection row for a card.
    async fn upsert_card_current(
        &self,
        row: &CardRow,
        stamp: &CurrentStamp,
    ) -> Result<(), StoreError>;

    /// Atomically swap the full current line-item set for a card.
    async fn replace_line_items_current(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> Result<(), StoreError>;

    /// Append line items to the master table; rows already present for the
    /// key are left untouched.
    async fn insert_line_items_master(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> Result<(), StoreError>;

    async fn finalize_event(&self, finalization: &EventFinalization) -> Result<(), StoreError>;

    /// Append one deferred operation to the retry queue. Returns the new
    /// update id.
    async fn enqueue_pending(&self, payload: &PendingPayload) -> Result<String, StoreError>;

    /// Claim up to `limit` due pending entries, transitioning each from
    /// `pending` to `processing`. Claims never overlap across callers.
    async fn claim_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingUpdate>, StoreError>;

    async fn complete_pending(
        &self,
        update: &PendingUpdate,
        outcome: PendingOutcome,
    ) -> Result<(), StoreError>;

    /// Whether other non-terminal pending rows reference the same event.
    async fn open_pending_for_event(
        &self,
        event_id: &str,
        excluding_update_id: &str,
    ) -> Result<bool, StoreError>;

    /// Unprocessed events older than `older_than` with no open pending rows;
    /// candidates for re-driving after a crash or stalled fetch.
    async fn stalled_events(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRow>, StoreError>;
}

/// Production store over a SQLite pool.
pub struct SqliteStore {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open (or create) the store database and bootstrap its tables.
pub async fn init_store_pool(db_path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Permanent(format!("create store directory: {e}")))?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to store: {}", db_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await?;

    schema::create_tables(&pool).await?;

    Ok(pool)
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_event(&self, event: &EventRow) -> Result<(), StoreError> {
        events::insert_event(&self.pool, event).await
    }

    async fn event_exists(&self, event_id: &str) -> Result<bool, StoreError> {
        events::event_exists(&self.pool, event_id).await
    }

    async fn last_known_description(&self, card_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(desc) = cards::current_description(&self.pool, card_id).await? {
            return Ok(Some(desc));
        }
        events::last_processed_description(&self.pool, card_id).await
    }

    async fn card_in_master(&self, card_id: &str) -> Result<bool, StoreError> {
        cards::exists_in_master(&self.pool, card_id).await
    }

    async fn insert_card_master_if_absent(
        &self,
        row: &CardRow,
        first_extracted_at: DateTime<Utc>,
        first_extraction_event_id: &str,
    ) -> Result<MasterInsert, StoreError> {
        cards::insert_master_if_absent(&self.pool, row, first_extracted_at, first_extraction_event_id)
            .await
    }

    async fn get_card_current(&self, card_id: &str) -> Result<Option<CurrentCard>, StoreError> {
        cards::get_current(&self.pool, card_id).await
    }

    async fn upsert_card_current(
        &self,
        row: &CardRow,
        stamp: &CurrentStamp,
    ) -> Result<(), StoreError> {
        cards::upsert_current(&self.pool, row, stamp).await
    }

    async fn replace_line_items_current(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> Result<(), StoreError> {
        line_items::replace_current(&self.pool, card_id, rows).await
    }

    async fn insert_line_items_master(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> Result<(), StoreError> {
        line_items::insert_master(&self.pool, card_id, rows).await
    }

    async fn finalize_event(&self, finalization: &EventFinalization) -> Result<(), StoreError> {
        events::finalize_event(&self.pool, finalization).await
    }

    async fn enqueue_pending(&self, payload: &PendingPayload) -> Result<String, StoreError> {
        pending::enqueue(&self.pool, payload).await
    }

    async fn claim_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingUpdate>, StoreError> {
        pending::claim_due(&self.pool, limit, now).await
    }

    async fn complete_pending(
        &self,
        update: &PendingUpdate,
        outcome: PendingOutcome,
    ) -> Result<(), StoreError> {
        pending::complete(&self.pool, &self.retry_policy, update, outcome).await
    }

    async fn open_pending_for_event(
        &self,
        event_id: &str,
        excluding_update_id: &str,
    ) -> Result<bool, StoreError> {
        pending::open_for_event(&self.pool, event_id, excluding_update_id).await
    }

    async fn stalled_events(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRow>, StoreError> {
        events::stalled_events(&self.pool, older_than, limit).await
    }
}
