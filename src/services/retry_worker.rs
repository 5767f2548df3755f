//! Background retry worker for deferred store operations
//!
//! Every tick the worker claims a bounded batch of due pending entries,
//! re-attempts each, and completes or requeues with exponential backoff.
//! It is the sole writer of the `completed` status: a notification's effect
//! is durable only once all of its queued operations have completed.
//!
//! The same tick also re-drives stalled events (unprocessed rows past a
//! threshold with no open pending work) from their stored raw payload,
//! which is how crash-interrupted and fetch-exhausted notifications converge.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RetrySettings;
use crate::db::{Store, StoreError};
use crate::models::{PendingOutcome, PendingPayload, PendingUpdate, WebhookPayload};
use crate::services::dispatcher::Dispatcher;
use crate::time;

/// Counters from one tick, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub redriven: usize,
}

pub struct RetryWorker {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    settings: RetrySettings,
}

impl RetryWorker {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>, settings: RetrySettings) -> Self {
        Self {
            store,
            dispatcher,
            settings,
        }
    }

    /// Spawn the long-lived tick loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(self.settings.tick_s));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(tick_s = self.settings.tick_s, "Retry worker started");
            loop {
                tick.tick().await;
                match self.run_once().await {
                    Ok(stats) if stats.claimed > 0 || stats.redriven > 0 => {
                        info!(
                            claimed = stats.claimed,
                            completed = stats.completed,
                            requeued = stats.requeued,
                            failed = stats.failed,
                            redriven = stats.redriven,
                            "Retry tick finished"
                        );
                    }
                    Ok(_) => debug!("Retry tick found nothing due"),
                    Err(e) => warn!(error = %e, "Retry tick failed"),
                }
            }
        })
    }

    /// One full pass: claim and apply due pending entries, then re-drive
    /// stalled events.
    pub async fn run_once(&self) -> Result<TickStats, StoreError> {
        let mut stats = TickStats::default();
        let now = time::now_ms();

        let claimed = self
            .store
            .claim_pending(self.settings.claim_batch, now)
            .await?;
        stats.claimed = claimed.len();

        for update in claimed {
            self.attempt(&update, &mut stats).await?;
        }

        stats.redriven = self.redrive_stalled(now).await?;
        Ok(stats)
    }

    async fn attempt(&self, update: &PendingUpdate, stats: &mut TickStats) -> Result<(), StoreError> {
        let payload: PendingPayload = match serde_json::from_str(&update.payload) {
            Ok(p) => p,
            Err(e) => {
                // Unreadable payloads cannot ever succeed
                self.store
                    .complete_pending(
                        update,
                        PendingOutcome::Failed {
                            error: format!("payload undecodable: {e}"),
                        },
                    )
                    .await?;
                stats.failed += 1;
                return Ok(());
            }
        };

        match self.apply(update, &payload).await {
            Ok(()) => {
                self.store
                    .complete_pending(update, PendingOutcome::Completed)
                    .await?;
                stats.completed += 1;
                debug!(
                    update_id = %update.update_id,
                    operation = update.operation_kind.as_str(),
                    "Pending update completed"
                );
                self.finalize_if_settled(update, &payload).await?;
            }
            Err(StoreError::Deferred(msg)) => {
                self.store
                    .complete_pending(update, PendingOutcome::Retry { error: msg })
                    .await?;
                stats.requeued += 1;
            }
            Err(e) => {
                self.store
                    .complete_pending(
                        update,
                        PendingOutcome::Failed {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                stats.failed += 1;
            }
        }
        Ok(())
    }

    async fn apply(&self, update: &PendingUpdate, payload: &PendingPayload) -> Result<(), StoreError> {
        match payload {
            PendingPayload::UpsertCard { row, stamp, .. } => {
                self.store.upsert_card_current(row, stamp).await
            }
            PendingPayload::ReplaceLineItems { card_id, rows, .. } => {
                self.store.replace_line_items_current(card_id, rows).await
            }
            PendingPayload::FinalizeEvent { finalize } => {
                // Finalization waits for its sibling operations
                if self
                    .store
                    .open_pending_for_event(&finalize.event_id, &update.update_id)
                    .await?
                {
                    return Err(StoreError::Deferred(
                        "sibling operations still open".to_string(),
                    ));
                }
                self.store.finalize_event(finalize).await
            }
        }
    }

    /// After a data op completes, finalize its event once no other open
    /// pending rows reference it.
    async fn finalize_if_settled(
        &self,
        update: &PendingUpdate,
        payload: &PendingPayload,
    ) -> Result<(), StoreError> {
        if matches!(payload, PendingPayload::FinalizeEvent { .. }) {
            return Ok(());
        }
        let finalize = payload.finalization();
        if self
            .store
            .open_pending_for_event(&finalize.event_id, &update.update_id)
            .await?
        {
            return Ok(());
        }
        match self.store.finalize_event(finalize).await {
            Ok(()) => {
                info!(event_id = %finalize.event_id, "Event finalized after deferred writes");
                Ok(())
            }
            Err(StoreError::Deferred(msg)) => {
                warn!(event_id = %finalize.event_id, %msg, "Finalization deferred again");
                self.store
                    .enqueue_pending(&PendingPayload::FinalizeEvent {
                        finalize: finalize.clone(),
                    })
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-drive unprocessed events older than the stall threshold from their
    /// stored payloads. Idempotent by construction: master inserts are
    /// conditional and projection writes overwrite.
    async fn redrive_stalled(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize, StoreError> {
        let threshold = now - ChronoDuration::seconds(self.settings.stalled_after_s);
        let stalled = self
            .store
            .stalled_events(threshold, self.settings.claim_batch)
            .await?;
        let mut redriven = 0;

        for event in stalled {
            let payload: WebhookPayload = match serde_json::from_str(&event.raw_payload) {
                Ok(p) => p,
                Err(e) => {
                    error!(event_id = %event.event_id, error = %e, "Stalled event payload unreadable");
                    self.store
                        .finalize_event(&crate::models::EventFinalization::failure(
                            &event.event_id,
                            false,
                            format!("malformed_payload: {e}"),
                        ))
                        .await?;
                    continue;
                }
            };
            info!(event_id = %event.event_id, "Re-driving stalled event");
            match self.dispatcher.run_pipeline(&payload.action).await {
                Ok(_) => redriven += 1,
                Err(e) => warn!(event_id = %event.event_id, error = %e, "Stalled event re-drive failed"),
            }
        }
        Ok(redriven)
    }
}
