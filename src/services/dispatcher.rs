//! Per-notification orchestration
//!
//! One notification flows: idempotency check → raw-event record →
//! classification → card fetch → conditional extraction → store writes →
//! event finalization. Writes execute in a fixed order (master inserts
//! first, then current-state replace, then finalize) so a crash mid-flight
//! leaves master rows present and a still-unprocessed event that the retry
//! worker's stalled scan can re-drive.
//!
//! Transient store rejections are converted into pending-update rows; the
//! event stays unfinalized until the retry worker completes them.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{Store, StoreError};
use crate::error::ProcessError;
use crate::models::{
    Action, CardRow, CurrentCard, CurrentStamp, EventFinalization, EventRow, PendingPayload,
    SourceCard,
};
use crate::services::card_locks::CardLocks;
use crate::services::classifier::{self, ChangeClass};
use crate::services::extractor::{CardFields, Extraction, Extractor};
use crate::services::source_client::{CardSource, SourceError};
use crate::time;

/// One parsed delivery handed from intake to the dispatcher pool.
#[derive(Debug)]
pub struct Notification {
    pub action: Action,
    /// Verbatim delivery body.
    pub raw_payload: String,
    pub received_at: DateTime<Utc>,
}

/// Terminal disposition of one notification's processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Event id already recorded.
    Dropped,
    /// Action kind or card id outside the pipeline's interest.
    Irrelevant,
    /// Source platform has no such card.
    CardAbsent,
    /// Extraction failed; event finalized with the failure.
    ExtractionFailed,
    /// One or more writes were deferred to the retry queue.
    Deferred,
    /// Left unfinalized for the stalled-event scan (fetch retries exhausted
    /// or an early write deferred).
    Stalled,
    /// A write failed permanently; event finalized with the failure.
    StoreFailed,
    /// All writes applied and the event finalized.
    Applied(ChangeClass),
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    source: Arc<dyn CardSource>,
    extractor: Arc<dyn Extractor>,
    locks: CardLocks,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn CardSource>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            store,
            source,
            extractor,
            locks: CardLocks::new(),
        }
    }

    /// Spawn the worker pool over the intake channel. Workers exit when the
    /// channel closes and drains.
    pub fn spawn_workers(
        self: &Arc<Self>,
        rx: mpsc::Receiver<Notification>,
        concurrency: usize,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        (0..concurrency.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    debug!(worker, "Dispatcher worker started");
                    loop {
                        let notification = { rx.lock().await.recv().await };
                        match notification {
                            Some(n) => dispatcher.process(n).await,
                            None => break,
                        }
                    }
                    debug!(worker, "Dispatcher worker stopped");
                })
            })
            .collect()
    }

    /// Process one notification, logging instead of propagating failures:
    /// nothing upstream can act on them.
    pub async fn process(&self, notification: Notification) {
        let event_id = notification.action.id.clone();
        match self.handle(notification).await {
            Ok(outcome) => {
                debug!(event_id = %event_id, ?outcome, "Notification settled");
            }
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Notification processing failed");
            }
        }
    }

    /// Full per-notification state machine, returning the terminal
    /// disposition.
    pub async fn handle(&self, notification: Notification) -> Result<Outcome, ProcessError> {
        let action = &notification.action;

        // Idempotency: at-least-once delivery means duplicates are routine
        if self.store.event_exists(&action.id).await? {
            info!(event_id = %action.id, "Duplicate delivery dropped");
            return Ok(Outcome::Dropped);
        }

        let event = EventRow::from_action(action, notification.raw_payload.clone(), time::now_ms());
        match self.store.insert_event(&event).await {
            Err(StoreError::DuplicateEvent(_)) => {
                info!(event_id = %action.id, "Duplicate delivery dropped at insert");
                return Ok(Outcome::Dropped);
            }
            other => other?,
        }

        self.run_pipeline(action).await
    }

    /// Classify and apply one recorded event. Also the entry point for the
    /// retry worker's stalled-event re-drive, where the event row already
    /// exists.
    pub async fn run_pipeline(&self, action: &Action) -> Result<Outcome, ProcessError> {
        let event_id = action.id.as_str();
        let kind = action.kind.as_deref().unwrap_or("");

        if !classifier::is_relevant(kind, action.card_id()) {
            debug!(event_id, kind, "Action irrelevant to projection");
            self.finalize_or_enqueue(EventFinalization::success(event_id, false))
                .await?;
            return Ok(Outcome::Irrelevant);
        }
        let card_id = action.card_id().unwrap_or_default().to_string();

        // Serialize classify/extract/write per card for the rest of the pass
        let _guard = self.locks.acquire(&card_id).await;

        let card = match self.source.fetch_card(&card_id).await {
            Ok(card) => card,
            Err(SourceError::CardAbsent(_)) => {
                info!(event_id, card_id = %card_id, "Card absent at source; finalizing as failed");
                self.finalize_or_enqueue(EventFinalization::failure(event_id, false, "card_absent"))
                    .await?;
                return Ok(Outcome::CardAbsent);
            }
            Err(e) => {
                // Transient exhaustion: leave unprocessed for the stalled scan
                warn!(event_id, card_id = %card_id, error = %e, "Card fetch failed; leaving event for re-drive");
                return Ok(Outcome::Stalled);
            }
        };

        let has_master = self.store.card_in_master(&card_id).await?;
        let previous_desc = self.store.last_known_description(&card_id).await?;
        let previous_current = self.store.get_card_current(&card_id).await?;
        let class = classifier::classify_update(
            has_master,
            previous_desc.as_deref(),
            card.desc.as_deref(),
        );

        info!(
            event_id,
            card_id = %card_id,
            kind,
            ?class,
            "Processing notification"
        );

        match class {
            ChangeClass::New => self.apply_new(action, &card).await,
            ChangeClass::DescChanged => {
                self.apply_desc_changed(action, &card, previous_current.as_ref())
                    .await
            }
            ChangeClass::MetadataOnly => {
                self.apply_metadata_only(action, &card, previous_current.as_ref())
                    .await
            }
        }
    }

    /// First observation: master insert + current insert + extraction +
    /// line items into both tables.
    async fn apply_new(&self, action: &Action, card: &SourceCard) -> Result<Outcome, ProcessError> {
        let event_id = action.id.as_str();
        let extraction = match self.extract(event_id, card).await? {
            Some(x) => x,
            None => return Ok(Outcome::ExtractionFailed),
        };

        let now = time::now_ms();
        let row = CardRow::compose(
            card,
            action,
            &extraction.card_fields,
            extraction.line_items.len() as i64,
        );

        // Master inserts first: idempotent, safe if a crash leaves them partial
        match self
            .store
            .insert_card_master_if_absent(&row, now, event_id)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Deferred(msg)) => {
                warn!(event_id, card_id = %row.card_id, %msg, "Master insert deferred; leaving event for re-drive");
                return Ok(Outcome::Stalled);
            }
            Err(e) => return self.finalize_permanent_failure(event_id, true, e).await,
        }
        match self
            .store
            .insert_line_items_master(&row.card_id, &extraction.line_items)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Deferred(msg)) => {
                warn!(event_id, card_id = %row.card_id, %msg, "Line-item master insert deferred; leaving event for re-drive");
                return Ok(Outcome::Stalled);
            }
            Err(e) => return self.finalize_permanent_failure(event_id, true, e).await,
        }

        let stamp = CurrentStamp {
            last_updated_at: now,
            last_extracted_at: Some(now),
            last_extraction_event_id: Some(event_id.to_string()),
            last_event_type: Some("createCard".to_string()),
        };
        let finalize = EventFinalization::success(event_id, true);

        self.apply_current_state(row, stamp, Some(extraction.line_items), finalize)
            .await
            .map(|outcome| match outcome {
                Outcome::Applied(_) => Outcome::Applied(ChangeClass::New),
                other => other,
            })
    }

    /// Description changed: re-extract, overwrite the projection, replace the
    /// current line-item set. Master rows stay untouched.
    async fn apply_desc_changed(
        &self,
        action: &Action,
        card: &SourceCard,
        previous: Option<&CurrentCard>,
    ) -> Result<Outcome, ProcessError> {
        let event_id = action.id.as_str();
        let extraction = match self.extract(event_id, card).await? {
            Some(x) => x,
            None => return Ok(Outcome::ExtractionFailed),
        };

        let now = time::now_ms();
        let row = CardRow::compose(
            card,
            action,
            &extraction.card_fields,
            extraction.line_items.len() as i64,
        );
        let stamp = CurrentStamp {
            last_updated_at: now,
            last_extracted_at: Some(now),
            last_extraction_event_id: Some(event_id.to_string()),
            last_event_type: Some(classifier::update_subtype(true, previous, card).to_string()),
        };
        let finalize = EventFinalization::success(event_id, true);

        self.apply_current_state(row, stamp, Some(extraction.line_items), finalize)
            .await
            .map(|outcome| match outcome {
                Outcome::Applied(_) => Outcome::Applied(ChangeClass::DescChanged),
                other => other,
            })
    }

    /// Metadata-only change: refresh the projection's metadata, keep the
    /// enrichment and extraction provenance, touch no line items.
    async fn apply_metadata_only(
        &self,
        action: &Action,
        card: &SourceCard,
        previous: Option<&CurrentCard>,
    ) -> Result<Outcome, ProcessError> {
        let event_id = action.id.as_str();
        let now = time::now_ms();

        // Carry enrichment forward from the existing projection; title fields
        // are recomputed locally since a rename is still metadata-only
        let carried = previous.map(|p| &p.row);
        let fields = CardFields {
            purchaser: None,
            order_summary: None,
            primary_buyer_name: carried.and_then(|r| r.primary_buyer_name.clone()),
            primary_buyer_email: carried.and_then(|r| r.primary_buyer_email.clone()),
        };
        let mut row = CardRow::compose(
            card,
            action,
            &fields,
            carried.map(|r| r.line_item_count).unwrap_or(0),
        );
        if row.list_name.is_none() && row.list_id.as_deref() == carried.and_then(|r| r.list_id.as_deref())
        {
            row.list_name = carried.and_then(|r| r.list_name.clone());
        }

        let stamp = CurrentStamp {
            last_updated_at: now,
            // None preserves the existing extraction provenance
            last_extracted_at: None,
            last_extraction_event_id: None,
            last_event_type: Some(classifier::update_subtype(false, previous, card).to_string()),
        };
        let finalize = EventFinalization::success(event_id, false);

        self.apply_current_state(row, stamp, None, finalize)
            .await
            .map(|outcome| match outcome {
                Outcome::Applied(_) => Outcome::Applied(ChangeClass::MetadataOnly),
                other => other,
            })
    }

    /// Current-state phase shared by all classes: upsert the projection row,
    /// optionally replace the current line-item set, then finalize. Deferred
    /// writes are enqueued with the finalization attached and the event is
    /// left unprocessed.
    async fn apply_current_state(
        &self,
        row: CardRow,
        stamp: CurrentStamp,
        line_items: Option<Vec<crate::models::LineItemRow>>,
        finalize: EventFinalization,
    ) -> Result<Outcome, ProcessError> {
        let event_id = finalize.event_id.clone();
        let card_id = row.card_id.clone();
        let mut deferred = false;

        match self.store.upsert_card_current(&row, &stamp).await {
            Ok(()) => {}
            Err(StoreError::Deferred(msg)) => {
                warn!(event_id = %event_id, card_id = %card_id, %msg, "Projection upsert deferred");
                self.store
                    .enqueue_pending(&PendingPayload::UpsertCard {
                        row: row.clone(),
                        stamp: stamp.clone(),
                        finalize: finalize.clone(),
                    })
                    .await?;
                deferred = true;
            }
            Err(e) => {
                return self
                    .finalize_permanent_failure(&event_id, finalize.extraction_triggered, e)
                    .await
            }
        }

        if let Some(items) = line_items {
            match self.store.replace_line_items_current(&card_id, &items).await {
                Ok(()) => {}
                Err(StoreError::Deferred(msg)) => {
                    warn!(event_id = %event_id, card_id = %card_id, %msg, "Line-item replace deferred");
                    self.store
                        .enqueue_pending(&PendingPayload::ReplaceLineItems {
                            card_id: card_id.clone(),
                            rows: items,
                            finalize: finalize.clone(),
                        })
                        .await?;
                    deferred = true;
                }
                Err(e) => {
                    return self
                        .finalize_permanent_failure(&event_id, finalize.extraction_triggered, e)
                        .await
                }
            }
        }

        if deferred {
            // The retry worker finalizes once the queued writes complete
            return Ok(Outcome::Deferred);
        }

        self.finalize_or_enqueue(finalize).await?;
        Ok(Outcome::Applied(ChangeClass::New))
    }

    async fn extract(
        &self,
        event_id: &str,
        card: &SourceCard,
    ) -> Result<Option<Extraction>, ProcessError> {
        match self.extractor.extract(card).await {
            Ok(extraction) => Ok(Some(extraction)),
            Err(e) => {
                warn!(event_id, card_id = %card.id, error = %e, "Extraction failed");
                self.finalize_or_enqueue(EventFinalization::failure(
                    event_id,
                    false,
                    format!("extraction_failed: {e}"),
                ))
                .await?;
                Ok(None)
            }
        }
    }

    /// Finalize an event; if the store defers the finalization itself, queue
    /// it as a pending op.
    async fn finalize_or_enqueue(&self, finalize: EventFinalization) -> Result<(), ProcessError> {
        match self.store.finalize_event(&finalize).await {
            Ok(()) => Ok(()),
            Err(StoreError::Deferred(msg)) => {
                warn!(event_id = %finalize.event_id, %msg, "Event finalization deferred");
                self.store
                    .enqueue_pending(&PendingPayload::FinalizeEvent { finalize })
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize_permanent_failure(
        &self,
        event_id: &str,
        extraction_triggered: bool,
        error: StoreError,
    ) -> Result<Outcome, ProcessError> {
        error!(event_id, error = %error, "Permanent store failure while applying writes");
        self.finalize_or_enqueue(EventFinalization::failure(
            event_id,
            extraction_triggered,
            format!("store_permanent: {error}"),
        ))
        .await?;
        Ok(Outcome::StoreFailed)
    }
}
