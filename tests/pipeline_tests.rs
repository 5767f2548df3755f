//! End-to-end pipeline behavior over a real store with fake collaborators:
//! the six core scenarios, duplicate delivery, deferred-write recovery,
//! stalled-event re-drive, and per-card serialization under concurrency.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use cardsink::config::RetrySettings;
use cardsink::db::Store;
use cardsink::models::line_item::PriceKind;
use cardsink::services::dispatcher::Outcome;
use cardsink::services::{ChangeClass, Dispatcher, RetryWorker};
use helpers::{
    count, current_line_items, event_status, notification, notification_from,
    notification_payload, source_card, test_pipeline, FailingExtractor,
};
use sqlx::Row;

fn retry_settings(stalled_after_s: i64) -> RetrySettings {
    RetrySettings {
        tick_s: 1,
        base_s: 0,
        max_attempts: 10,
        cap_s: 3600,
        stalled_after_s,
        claim_batch: 50,
    }
}

// =============================================================================
// Scenario 1: new card
// =============================================================================

#[tokio::test]
async fn test_new_card_populates_all_tables() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));

    let outcome = p
        .dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::New));

    let (processed, triggered, error) = event_status(&p.pool, "E1").await;
    assert!(processed);
    assert_eq!(triggered, Some(true));
    assert_eq!(error, None);

    let master = sqlx::query("SELECT purchaser, first_extraction_event_id FROM cards_master WHERE card_id = 'C1'")
        .fetch_one(&p.pool)
        .await
        .unwrap();
    assert_eq!(master.get::<String, _>("purchaser"), "Acme");
    assert_eq!(master.get::<String, _>("first_extraction_event_id"), "E1");

    let current = p.store.get_card_current("C1").await.unwrap().unwrap();
    assert_eq!(current.row.line_item_count, 1);
    assert_eq!(current.last_extraction_event_id.as_deref(), Some("E1"));
    assert_eq!(current.last_event_type.as_deref(), Some("createCard"));
    assert_eq!(
        current.row.primary_buyer_name.as_deref(),
        Some("Jordan Buyer")
    );

    for table in ["line_items_master", "line_items_current"] {
        let items = sqlx::query(&format!("SELECT * FROM {table} WHERE card_id = 'C1'"))
            .fetch_all(&p.pool)
            .await
            .unwrap();
        assert_eq!(items.len(), 1, "{table}");
        let item = &items[0];
        assert_eq!(item.get::<i64, _>("line_index"), 1, "{table}");
        assert_eq!(item.get::<i64, _>("quantity"), 1, "{table}");
        assert_eq!(item.get::<f64, _>("raw_price"), 100.0, "{table}");
        assert_eq!(item.get::<String, _>("price_kind"), "total", "{table}");
        assert_eq!(item.get::<f64, _>("unit_price"), 100.0, "{table}");
        assert_eq!(item.get::<f64, _>("total_revenue"), 100.0, "{table}");
    }
}

// =============================================================================
// Scenarios 2-4 build on the same card's history
// =============================================================================

#[tokio::test]
async fn test_card_lifecycle_move_then_desc_change_then_duplicate() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));
    p.dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();
    let first_extraction = p
        .store
        .get_card_current("C1")
        .await
        .unwrap()
        .unwrap()
        .last_extracted_at;
    let extractions_after_create = p.extractor.calls();

    // --- Scenario 2: list move, description unchanged -----------------------
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L2"));
    let payload = notification_payload(
        "E2",
        "updateCard",
        "C1",
        serde_json::json!({
            "listBefore": {"id": "L1", "name": "Quoting"},
            "listAfter": {"id": "L2", "name": "Production"},
        }),
    );
    let outcome = p
        .dispatcher
        .handle(notification_from(&payload))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::MetadataOnly));

    let event = sqlx::query(
        "SELECT is_list_transition, processed, extraction_triggered FROM webhook_events WHERE event_id = 'E2'",
    )
    .fetch_one(&p.pool)
    .await
    .unwrap();
    assert!(event.get::<bool, _>("is_list_transition"));
    assert!(event.get::<bool, _>("processed"));
    assert_eq!(event.get::<Option<bool>, _>("extraction_triggered"), Some(false));

    // No extraction ran; master untouched; projection follows the move
    assert_eq!(p.extractor.calls(), extractions_after_create);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_master").await, 1);
    let current = p.store.get_card_current("C1").await.unwrap().unwrap();
    assert_eq!(current.row.list_id.as_deref(), Some("L2"));
    assert_eq!(current.last_event_type.as_deref(), Some("updateCard:list_moved"));
    assert_eq!(current.last_extracted_at, first_extraction);
    // Enrichment carried forward without re-extraction
    assert_eq!(current.row.primary_buyer_name.as_deref(), Some("Jordan Buyer"));

    // --- Scenario 3: description change -------------------------------------
    tokio::time::sleep(Duration::from_millis(5)).await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "2x Sign $300 total", "L2"));
    let outcome = p
        .dispatcher
        .handle(notification("E3", "updateCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::DescChanged));

    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_master").await, 1);
    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM line_items_master").await,
        1,
        "master line items stay at first observation"
    );

    let current = p.store.get_card_current("C1").await.unwrap().unwrap();
    assert_eq!(current.last_extraction_event_id.as_deref(), Some("E3"));
    assert!(current.last_extracted_at > first_extraction);
    assert_eq!(
        current.last_event_type.as_deref(),
        Some("updateCard:desc_changed")
    );

    let items = current_line_items(&p.pool, "C1").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 2);
    assert_eq!(items[0].raw_price, Some(300.0));
    assert_eq!(items[0].price_kind, PriceKind::Total);
    assert_eq!(items[0].unit_price, Some(150.0));
    assert_eq!(items[0].total_revenue, Some(300.0));

    // --- Scenario 4: verbatim duplicate delivery ----------------------------
    let extractions_before_dup = p.extractor.calls();
    let outcome = p
        .dispatcher
        .handle(notification("E3", "updateCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Dropped);

    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM webhook_events WHERE event_id = 'E3'").await,
        1
    );
    assert_eq!(p.extractor.calls(), extractions_before_dup);
    let items = current_line_items(&p.pool, "C1").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 2);
}

// =============================================================================
// Scenario 5: deferred write, then retry-worker recovery
// =============================================================================

#[tokio::test]
async fn test_deferred_line_item_write_recovers_on_retry_tick() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));
    p.dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();

    // The store rejects the next line-item replace transiently
    p.source
        .put_card(source_card("C1", "Acme | signs", "2x Sign $300 total", "L1"));
    p.store.fail_next_replaces(1);
    let outcome = p
        .dispatcher
        .handle(notification("E4", "updateCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Deferred);

    let pending = sqlx::query("SELECT operation_kind, status, event_id FROM pending_updates")
        .fetch_all(&p.pool)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].get::<String, _>("operation_kind"), "replace_line_items");
    assert_eq!(pending[0].get::<String, _>("status"), "pending");
    assert_eq!(pending[0].get::<String, _>("event_id"), "E4");

    let (processed, _, _) = event_status(&p.pool, "E4").await;
    assert!(!processed, "event must stay unfinalized while writes are queued");
    // The old line-item set is still visible, never a partial merge
    let items = current_line_items(&p.pool, "C1").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 1);

    // Next tick: store accepts writes again
    let worker = RetryWorker::new(p.store.clone(), p.dispatcher.clone(), retry_settings(600));
    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);

    let status: String = sqlx::query_scalar("SELECT status FROM pending_updates")
        .fetch_one(&p.pool)
        .await
        .unwrap();
    assert_eq!(status, "completed");
    let (processed, triggered, _) = event_status(&p.pool, "E4").await;
    assert!(processed);
    assert_eq!(triggered, Some(true));
    let items = current_line_items(&p.pool, "C1").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 2);
}

// =============================================================================
// Scenario 6: irrelevant action
// =============================================================================

#[tokio::test]
async fn test_irrelevant_action_is_recorded_and_finalized_only() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));

    let outcome = p
        .dispatcher
        .handle(notification("E5", "commentCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Irrelevant);

    let (processed, triggered, error) = event_status(&p.pool, "E5").await;
    assert!(processed);
    assert_eq!(triggered, Some(false));
    assert_eq!(error, None);

    assert_eq!(p.source.fetches(), 0);
    assert_eq!(p.extractor.calls(), 0);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_master").await, 0);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_current").await, 0);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM line_items_current").await, 0);
}

// =============================================================================
// Boundary behaviors
// =============================================================================

#[tokio::test]
async fn test_empty_description_on_create() {
    let p = test_pipeline().await;
    p.source.put_card(source_card("C1", "Acme | signs", "", "L1"));

    let outcome = p
        .dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::New));

    let current = p.store.get_card_current("C1").await.unwrap().unwrap();
    assert_eq!(current.row.line_item_count, 0);
    assert!(current_line_items(&p.pool, "C1").await.is_empty());
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_master").await, 1);
}

#[tokio::test]
async fn test_description_empty_to_filled_then_back_to_blank() {
    let p = test_pipeline().await;
    p.source.put_card(source_card("C1", "Acme | signs", "", "L1"));
    p.dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();

    // Empty -> non-empty is a description change and populates line items
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));
    let outcome = p
        .dispatcher
        .handle(notification("E2", "updateCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::DescChanged));
    assert_eq!(current_line_items(&p.pool, "C1").await.len(), 1);

    // Non-empty -> blank clears the current set
    p.source.put_card(source_card("C1", "Acme | signs", "", "L1"));
    let outcome = p
        .dispatcher
        .handle(notification("E3", "updateCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::DescChanged));
    assert!(current_line_items(&p.pool, "C1").await.is_empty());
}

#[tokio::test]
async fn test_byte_equivalent_description_is_metadata_only() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));
    p.dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();
    let calls_after_create = p.extractor.calls();
    let extracted_at = p
        .store
        .get_card_current("C1")
        .await
        .unwrap()
        .unwrap()
        .last_extracted_at;

    // Same text modulo CRLF and surrounding whitespace
    p.source
        .put_card(source_card("C1", "Acme | signs", " 1x Sign $100\r\n", "L1"));
    let outcome = p
        .dispatcher
        .handle(notification("E2", "updateCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::MetadataOnly));
    assert_eq!(p.extractor.calls(), calls_after_create);

    let current = p.store.get_card_current("C1").await.unwrap().unwrap();
    assert_eq!(current.last_extracted_at, extracted_at);
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_card_absent_finalizes_as_failed() {
    let p = test_pipeline().await;
    let outcome = p
        .dispatcher
        .handle(notification("E1", "createCard", "GONE"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::CardAbsent);

    let (processed, triggered, error) = event_status(&p.pool, "E1").await;
    assert!(processed);
    assert_eq!(triggered, Some(false));
    assert_eq!(error.as_deref(), Some("card_absent"));
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_master").await, 0);
}

#[tokio::test]
async fn test_extraction_failure_finalizes_without_retry() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));
    let dispatcher = Arc::new(Dispatcher::new(
        p.store.clone(),
        p.source.clone(),
        Arc::new(FailingExtractor),
    ));

    let outcome = dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::ExtractionFailed);

    let (processed, triggered, error) = event_status(&p.pool, "E1").await;
    assert!(processed);
    assert_eq!(triggered, Some(false));
    assert!(error.unwrap().starts_with("extraction_failed"));
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM pending_updates").await, 0);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_current").await, 0);
}

#[tokio::test]
async fn test_deferred_finalization_is_enqueued_and_retried() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));

    // Only the finalization write is rejected; data writes land
    p.store.fail_next_finalizes(1);
    let outcome = p
        .dispatcher
        .handle(notification("E1", "createCard", "C1"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(ChangeClass::New));

    let (processed, _, _) = event_status(&p.pool, "E1").await;
    assert!(!processed);
    let kind: String = sqlx::query_scalar("SELECT operation_kind FROM pending_updates")
        .fetch_one(&p.pool)
        .await
        .unwrap();
    assert_eq!(kind, "finalize_event");

    let worker = RetryWorker::new(p.store.clone(), p.dispatcher.clone(), retry_settings(600));
    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.completed, 1);
    let (processed, triggered, _) = event_status(&p.pool, "E1").await;
    assert!(processed);
    assert_eq!(triggered, Some(true));
}

// =============================================================================
// Crash recovery: stalled-event re-drive
// =============================================================================

#[tokio::test]
async fn test_stalled_event_is_redriven_to_convergence() {
    let p = test_pipeline().await;
    p.source
        .put_card(source_card("C1", "Acme | signs", "1x Sign $100", "L1"));

    // Simulate a crash between insert_event and any downstream work
    let n = notification("E1", "createCard", "C1");
    let event = cardsink::models::EventRow::from_action(
        &n.action,
        n.raw_payload.clone(),
        cardsink::time::now_ms(),
    );
    p.store.insert_event(&event).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let worker = RetryWorker::new(p.store.clone(), p.dispatcher.clone(), retry_settings(0));
    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.redriven, 1);

    let (processed, triggered, error) = event_status(&p.pool, "E1").await;
    assert!(processed);
    assert_eq!(triggered, Some(true));
    assert_eq!(error, None);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM cards_master").await, 1);
    assert_eq!(current_line_items(&p.pool, "C1").await.len(), 1);
}

// =============================================================================
// Per-card serialization under concurrent deliveries
// =============================================================================

#[tokio::test]
async fn test_concurrent_notifications_for_one_card_stay_consistent() {
    let p = test_pipeline().await;
    p.source.put_card(source_card(
        "C1",
        "Acme | signs",
        "1x Alpha $100\n1x Beta $200",
        "L1",
    ));
    p.dispatcher
        .handle(notification("E0", "createCard", "C1"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for version in 1..=8i64 {
        let dispatcher = p.dispatcher.clone();
        let source = p.source.clone();
        handles.push(tokio::spawn(async move {
            source.put_card(source_card(
                "C1",
                "Acme | signs",
                &format!("{version}x Alpha $100\n{version}x Beta $200"),
                "L1",
            ));
            dispatcher
                .handle(notification(&format!("EV{version}"), "updateCard", "C1"))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // At rest, the current set is the output of a single extraction run:
    // contiguous indexes and one consistent version throughout
    let items = current_line_items(&p.pool, "C1").await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].line_index, 1);
    assert_eq!(items[1].line_index, 2);
    assert_eq!(
        items[0].quantity, items[1].quantity,
        "line items must come from one extraction run, not a merge"
    );
    let current = p.store.get_card_current("C1").await.unwrap().unwrap();
    assert_eq!(current.row.line_item_count, 2);
    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM webhook_events WHERE processed = 0").await,
        0
    );
}
