//! Retry-queue table operations
//!
//! The queue is the durable frontier for deferred writes. Claims use a
//! conditional status transition so a row is handed to exactly one worker.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::{RetryPolicy, StoreError};
use crate::models::{
    OperationKind, PendingOutcome, PendingPayload, PendingStatus, PendingUpdate,
};
use crate::time;

/// Append one deferred operation with `status = pending` and an immediate
/// `next_retry_at`. Returns the new update id.
pub async fn enqueue(pool: &SqlitePool, payload: &PendingPayload) -> Result<String, StoreError> {
    let update_id = Uuid::new_v4().to_string();
    let now = time::now_ms();
    let body = serde_json::to_string(payload)?;

    sqlx::query(
        r#"
        INSERT INTO pending_updates (
            update_id, operation_kind, target_table, event_id, payload,
            retry_count, first_queued_at, last_retry_at, next_retry_at,
            status, error_message, completed_at, created_at
        ) VALUES (?, ?, ?, ?, ?, 0, ?, NULL, ?, 'pending', NULL, NULL, ?)
        "#,
    )
    .bind(&update_id)
    .bind(payload.kind().as_str())
    .bind(payload.target_table())
    .bind(payload.event_id())
    .bind(&body)
    .bind(time::to_db(now))
    .bind(time::to_db(now))
    .bind(time::to_db(now))
    .execute(pool)
    .await?;

    tracing::info!(
        update_id = %update_id,
        operation = payload.kind().as_str(),
        event_id = payload.event_id(),
        "Enqueued deferred store operation"
    );
    Ok(update_id)
}

/// Claim up to `limit` due pending rows.
///
/// Each candidate is transitioned with a conditional update
/// (`status = 'pending'` → `'processing'`); a row that lost the race to
/// another worker is skipped.
pub async fn claim_due(
    pool: &SqlitePool,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<Vec<PendingUpdate>, StoreError> {
    let candidates = sqlx::query(
        r#"
        SELECT * FROM pending_updates
        WHERE status = 'pending' AND next_retry_at <= ?
        ORDER BY first_queued_at ASC
        LIMIT ?
        "#,
    )
    .bind(time::to_db(now))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for row in candidates {
        let update_id: String = row.get("update_id");
        let result = sqlx::query(
            r#"
            UPDATE pending_updates
            SET status = 'processing', last_retry_at = ?
            WHERE update_id = ? AND status = 'pending'
            "#,
        )
        .bind(time::to_db(now))
        .bind(&update_id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            let mut update = row_to_update(&row)?;
            update.status = PendingStatus::Processing;
            update.last_retry_at = Some(now);
            claimed.push(update);
        }
    }
    Ok(claimed)
}

/// Apply the outcome of one attempt.
///
/// `Retry` requeues with exponential backoff until the retry budget is
/// exhausted, after which the row is `failed` and left for an operator.
pub async fn complete(
    pool: &SqlitePool,
    policy: &RetryPolicy,
    update: &PendingUpdate,
    outcome: PendingOutcome,
) -> Result<(), StoreError> {
    let now = time::now_ms();
    match outcome {
        PendingOutcome::Completed => {
            sqlx::query(
                r#"
                UPDATE pending_updates
                SET status = 'completed', completed_at = ?, error_message = NULL
                WHERE update_id = ?
                "#,
            )
            .bind(time::to_db(now))
            .bind(&update.update_id)
            .execute(pool)
            .await?;
        }
        PendingOutcome::Retry { error } => {
            let attempts = update.retry_count + 1;
            if attempts >= policy.max_attempts {
                tracing::error!(
                    update_id = %update.update_id,
                    event_id = %update.event_id,
                    attempts,
                    "Retry budget exhausted; marking pending update failed"
                );
                mark_failed(pool, &update.update_id, &error).await?;
            } else {
                let next = now + backoff_delay(policy, attempts);
                sqlx::query(
                    r#"
                    UPDATE pending_updates
                    SET status = 'pending', retry_count = ?, next_retry_at = ?, error_message = ?
                    WHERE update_id = ?
                    "#,
                )
                .bind(attempts)
                .bind(time::to_db(next))
                .bind(&error)
                .bind(&update.update_id)
                .execute(pool)
                .await?;
            }
        }
        PendingOutcome::Failed { error } => {
            tracing::error!(
                update_id = %update.update_id,
                event_id = %update.event_id,
                error = %error,
                "Pending update failed permanently"
            );
            mark_failed(pool, &update.update_id, &error).await?;
        }
    }
    Ok(())
}

async fn mark_failed(pool: &SqlitePool, update_id: &str, error: &str) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE pending_updates SET status = 'failed', error_message = ? WHERE update_id = ?",
    )
    .bind(error)
    .bind(update_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Whether other non-terminal rows reference the same event.
pub async fn open_for_event(
    pool: &SqlitePool,
    event_id: &str,
    excluding_update_id: &str,
) -> Result<bool, StoreError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM pending_updates
        WHERE event_id = ?
          AND update_id != ?
          AND status IN ('pending', 'processing')
        "#,
    )
    .bind(event_id)
    .bind(excluding_update_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Backoff before attempt `retry_count + 1`: `base × 2^retry_count` plus
/// jitter, capped.
pub fn backoff_delay(policy: &RetryPolicy, retry_count: i64) -> Duration {
    let shift = retry_count.clamp(0, 20) as u32;
    let exp = policy.base_s.saturating_mul(1i64 << shift);
    let capped = exp.min(policy.cap_s);
    let jitter = rand::thread_rng().gen_range(0..=policy.base_s.max(1) / 2);
    Duration::seconds(capped + jitter)
}

fn row_to_update(row: &sqlx::sqlite::SqliteRow) -> Result<PendingUpdate, StoreError> {
    let kind_str: String = row.get("operation_kind");
    let status_str: String = row.get("status");
    Ok(PendingUpdate {
        update_id: row.get("update_id"),
        operation_kind: OperationKind::parse(&kind_str)
            .ok_or_else(|| StoreError::Permanent(format!("unknown operation kind {kind_str}")))?,
        target_table: row.get("target_table"),
        event_id: row.get("event_id"),
        payload: row.get("payload"),
        retry_count: row.get("retry_count"),
        first_queued_at: time::from_db(&row.get::<String, _>("first_queued_at"))?,
        last_retry_at: time::opt_from_db(row.get("last_retry_at"))?,
        next_retry_at: time::from_db(&row.get::<String, _>("next_retry_at"))?,
        status: PendingStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Permanent(format!("unknown pending status {status_str}")))?,
        error_message: row.get("error_message"),
        completed_at: time::opt_from_db(row.get("completed_at"))?,
        created_at: time::from_db(&row.get::<String, _>("created_at"))?,
    })
}
