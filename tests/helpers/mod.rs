//! Shared test fixtures: file-backed stores, fake collaborators, and a
//! deferral-injecting store wrapper.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use cardsink::db::{self, MasterInsert, RetryPolicy, SqliteStore, Store, StoreError};
use cardsink::models::card::parse_title_fields;
use cardsink::models::line_item::{derive_prices, PriceKind};
use cardsink::models::{
    CardRow, CurrentCard, CurrentStamp, EventFinalization, EventRow, LineItemRow, PendingOutcome,
    PendingPayload, PendingUpdate, SourceCard,
};
use cardsink::services::classifier::normalize_description;
use cardsink::services::dispatcher::Notification;
use cardsink::services::extractor::{CardFields, ExtractError, Extraction, Extractor};
use cardsink::services::source_client::{CardSource, SourceError};
use cardsink::services::Dispatcher;
use cardsink::time;

// ---------------------------------------------------------------------------
// Store fixtures
// ---------------------------------------------------------------------------

pub struct TestStore {
    pub store: Arc<SqliteStore>,
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn test_store() -> TestStore {
    test_store_with_policy(RetryPolicy {
        base_s: 0,
        cap_s: 3600,
        max_attempts: 10,
    })
    .await
}

pub async fn test_store_with_policy(policy: RetryPolicy) -> TestStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = db::init_store_pool(&dir.path().join("test.db"))
        .await
        .expect("store init");
    TestStore {
        store: Arc::new(SqliteStore::new(pool.clone(), policy)),
        pool,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Fake source platform
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCardSource {
    cards: Mutex<HashMap<String, SourceCard>>,
    fetches: AtomicUsize,
}

impl FakeCardSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_card(&self, card: SourceCard) {
        self.cards.lock().unwrap().insert(card.id.clone(), card);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CardSource for FakeCardSource {
    async fn fetch_card(&self, card_id: &str) -> Result<SourceCard, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.cards
            .lock()
            .unwrap()
            .get(card_id)
            .cloned()
            .ok_or_else(|| SourceError::CardAbsent(card_id.to_string()))
    }
}

pub fn source_card(id: &str, name: &str, desc: &str, list_id: &str) -> SourceCard {
    SourceCard {
        id: id.to_string(),
        name: Some(name.to_string()),
        desc: Some(desc.to_string()),
        closed: false,
        id_list: Some(list_id.to_string()),
        id_board: Some("B1".to_string()),
        date_last_activity: None,
        labels: vec![],
        attachments: vec![],
    }
}

// ---------------------------------------------------------------------------
// Fake extractor
// ---------------------------------------------------------------------------

/// Deterministic extractor: each non-empty description line of the form
/// `"<qty>x <desc> $<price> [ea|total]"` becomes one line item.
#[derive(Default)]
pub struct FakeExtractor {
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn parse_line(line: &str, index: i64) -> LineItemRow {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let quantity = tokens
            .first()
            .and_then(|t| t.trim_end_matches(['x', 'X']).parse::<i64>().ok())
            .unwrap_or(1);
        let raw_price = tokens
            .iter()
            .find(|t| t.starts_with('$'))
            .and_then(|t| t.trim_start_matches('$').parse::<f64>().ok());
        let kind = if tokens
            .iter()
            .any(|t| matches!(t.to_ascii_lowercase().as_str(), "ea" | "each"))
        {
            PriceKind::PerUnit
        } else {
            PriceKind::Total
        };
        let prices = derive_prices(raw_price, quantity, kind);
        LineItemRow {
            line_index: index,
            quantity,
            raw_price,
            price_kind: kind,
            unit_price: prices.unit_price,
            total_revenue: prices.total_revenue,
            description: Some(line.to_string()),
            business_line: None,
            material: None,
            dimensions: None,
        }
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, card: &SourceCard) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (purchaser, order_summary) = match card.name.as_deref() {
            Some(name) => parse_title_fields(name),
            None => (None, None),
        };
        let desc = normalize_description(card.desc.as_deref());
        if desc.is_empty() {
            return Ok(Extraction {
                card_fields: CardFields {
                    purchaser,
                    order_summary,
                    ..CardFields::default()
                },
                line_items: vec![],
            });
        }

        let line_items = desc
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(i, line)| Self::parse_line(line, (i + 1) as i64))
            .collect();

        Ok(Extraction {
            card_fields: CardFields {
                purchaser,
                order_summary,
                primary_buyer_name: Some("Jordan Buyer".to_string()),
                primary_buyer_email: Some("jordan@example.com".to_string()),
            },
            line_items,
        })
    }
}

/// Extractor that always fails, for the failure-path tests.
pub struct FailingExtractor;

#[async_trait]
impl Extractor for FailingExtractor {
    async fn extract(&self, _card: &SourceCard) -> Result<Extraction, ExtractError> {
        Err(ExtractError::Timeout(300))
    }
}

// ---------------------------------------------------------------------------
// Deferral-injecting store wrapper
// ---------------------------------------------------------------------------

/// Wraps the real store and fails the next N calls of selected operations
/// with a transient rejection, the way the analytical backend refuses writes
/// against freshly streamed rows.
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    fail_upserts: AtomicI64,
    fail_replaces: AtomicI64,
    fail_finalizes: AtomicI64,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_upserts: AtomicI64::new(0),
            fail_replaces: AtomicI64::new(0),
            fail_finalizes: AtomicI64::new(0),
        }
    }

    pub fn fail_next_replaces(&self, n: i64) {
        self.fail_replaces.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_upserts(&self, n: i64) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_finalizes(&self, n: i64) {
        self.fail_finalizes.store(n, Ordering::SeqCst);
    }

    fn should_fail(counter: &AtomicI64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_event(&self, event: &EventRow) -> Result<(), StoreError> {
        self.inner.insert_event(event).await
    }

    async fn event_exists(&self, event_id: &str) -> Result<bool, StoreError> {
        self.inner.event_exists(event_id).await
    }

    async fn last_known_description(&self, card_id: &str) -> Result<Option<String>, StoreError> {
        self.inner.last_known_description(card_id).await
    }

    async fn card_in_master(&self, card_id: &str) -> Result<bool, StoreError> {
        self.inner.card_in_master(card_id).await
    }

    async fn insert_card_master_if_absent(
        &self,
        row: &CardRow,
        first_extracted_at: DateTime<Utc>,
        first_extraction_event_id: &str,
    ) -> Result<MasterInsert, StoreError> {
        self.inner
            .insert_card_master_if_absent(row, first_extracted_at, first_extraction_event_id)
            .await
    }

    async fn get_card_current(&self, card_id: &str) -> Result<Option<CurrentCard>, StoreError> {
        self.inner.get_card_current(card_id).await
    }

    async fn upsert_card_current(
        &self,
        row: &CardRow,
        stamp: &CurrentStamp,
    ) -> Result<(), StoreError> {
        if Self::should_fail(&self.fail_upserts) {
            return Err(StoreError::Deferred("streaming buffer rejection".into()));
        }
        self.inner.upsert_card_current(row, stamp).await
    }

    async fn replace_line_items_current(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> Result<(), StoreError> {
        if Self::should_fail(&self.fail_replaces) {
            return Err(StoreError::Deferred("streaming buffer rejection".into()));
        }
        self.inner.replace_line_items_current(card_id, rows).await
    }

    async fn insert_line_items_master(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> Result<(), StoreError> {
        self.inner.insert_line_items_master(card_id, rows).await
    }

    async fn finalize_event(&self, finalization: &EventFinalization) -> Result<(), StoreError> {
        if Self::should_fail(&self.fail_finalizes) {
            return Err(StoreError::Deferred("streaming buffer rejection".into()));
        }
        self.inner.finalize_event(finalization).await
    }

    async fn enqueue_pending(&self, payload: &PendingPayload) -> Result<String, StoreError> {
        self.inner.enqueue_pending(payload).await
    }

    async fn claim_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingUpdate>, StoreError> {
        self.inner.claim_pending(limit, now).await
    }

    async fn complete_pending(
        &self,
        update: &PendingUpdate,
        outcome: PendingOutcome,
    ) -> Result<(), StoreError> {
        self.inner.complete_pending(update, outcome).await
    }

    async fn open_pending_for_event(
        &self,
        event_id: &str,
        excluding_update_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner
            .open_pending_for_event(event_id, excluding_update_id)
            .await
    }

    async fn stalled_events(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.inner.stalled_events(older_than, limit).await
    }
}

// ---------------------------------------------------------------------------
// Pipeline fixture
// ---------------------------------------------------------------------------

pub struct TestPipeline {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<FlakyStore>,
    pub sqlite: Arc<SqliteStore>,
    pub source: Arc<FakeCardSource>,
    pub extractor: Arc<FakeExtractor>,
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn test_pipeline() -> TestPipeline {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = db::init_store_pool(&dir.path().join("test.db"))
        .await
        .expect("store init");
    let sqlite = Arc::new(SqliteStore::new(
        pool.clone(),
        RetryPolicy {
            base_s: 0,
            cap_s: 3600,
            max_attempts: 10,
        },
    ));
    let store = Arc::new(FlakyStore::new(sqlite.clone()));
    let source = Arc::new(FakeCardSource::new());
    let extractor = Arc::new(FakeExtractor::new());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        source.clone(),
        extractor.clone(),
    ));
    TestPipeline {
        dispatcher,
        store,
        sqlite,
        source,
        extractor,
        pool,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Notification builders and row probes
// ---------------------------------------------------------------------------

pub fn notification_payload(
    event_id: &str,
    action_kind: &str,
    card_id: &str,
    extra_data: serde_json::Value,
) -> serde_json::Value {
    let mut data = serde_json::json!({
        "board": {"id": "B1", "name": "Orders"},
        "card": {"id": card_id, "name": "Card"},
    });
    if let (Some(data_obj), Some(extra)) = (data.as_object_mut(), extra_data.as_object()) {
        for (k, v) in extra {
            data_obj.insert(k.clone(), v.clone());
        }
    }
    serde_json::json!({
        "action": {
            "id": event_id,
            "type": action_kind,
            "date": "2026-07-01T12:00:00.000Z",
            "memberCreator": {"id": "M1", "username": "pat"},
            "data": data,
        },
        "model": {"id": "B1"}
    })
}

pub fn notification_from(payload: &serde_json::Value) -> Notification {
    let parsed: cardsink::models::WebhookPayload =
        serde_json::from_value(payload.clone()).expect("payload parses");
    Notification {
        action: parsed.action,
        raw_payload: payload.to_string(),
        received_at: time::now_ms(),
    }
}

pub fn notification(event_id: &str, action_kind: &str, card_id: &str) -> Notification {
    notification_from(&notification_payload(
        event_id,
        action_kind,
        card_id,
        serde_json::json!({}),
    ))
}

/// (processed, extraction_triggered, error_message) for an event row.
pub async fn event_status(
    pool: &SqlitePool,
    event_id: &str,
) -> (bool, Option<bool>, Option<String>) {
    let row = sqlx::query(
        "SELECT processed, extraction_triggered, error_message FROM webhook_events WHERE event_id = ?",
    )
    .bind(event_id)
    .fetch_one(pool)
    .await
    .expect("event row");
    (
        row.get("processed"),
        row.get("extraction_triggered"),
        row.get("error_message"),
    )
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.expect("count")
}

pub async fn current_line_items(pool: &SqlitePool, card_id: &str) -> Vec<LineItemRow> {
    cardsink::db::line_items::get_current(pool, card_id)
        .await
        .expect("line items")
}
