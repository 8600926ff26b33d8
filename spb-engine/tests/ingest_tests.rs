//! Ingest integration tests against an in-memory meeting source

mod helpers;

use helpers::*;
use serde_json::json;
use spb_engine::db::{cursors, documents, items, meetings};
use spb_engine::services::{IngestCursor, SourceError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn council_source() -> Arc<FakeSource> {
    let source = Arc::new(FakeSource::new());
    source.add_event(
        raw_event(101, "City Council", "2024-03-01"),
        vec![
            raw_item(1, 1, "Housing Policy Update"),
            raw_item(2, 2, "Road Repair Contract"),
            raw_item(3, 3, "Budget Amendment"),
        ],
    );
    source
}

#[tokio::test]
async fn test_first_ingest_writes_and_enqueues_everything() {
    let (_dir, pool) = create_test_db().await;
    let ingestor = ingestor(council_source(), &pool, 25);

    let (cursor, report) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert_eq!(report.events_fetched, 1);
    assert_eq!(report.meetings_new, 1);
    assert_eq!(report.items_new, 3);
    assert_eq!(report.messages_enqueued, 3);
    assert_eq!(report.documents_written, 1);
    assert!(report.window_exhausted);
    assert!(cursor.is_none());

    assert_eq!(test_queue(&pool).stats().await.unwrap().visible, 3);
    assert_eq!(items::count(&pool).await.unwrap(), 3);
}

#[tokio::test]
async fn test_reingest_of_unchanged_source_enqueues_nothing() {
    let (_dir, pool) = create_test_db().await;
    let ingestor = ingestor(council_source(), &pool, 25);

    ingestor.ingest_as_of(None, None, today()).await.unwrap();
    let (_, second) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert_eq!(second.messages_enqueued, 0);
    assert_eq!(second.items_unchanged, 3);
    assert_eq!(second.meetings_unchanged, 1);
    assert_eq!(second.documents_written, 0);
    assert_eq!(test_queue(&pool).stats().await.unwrap().visible, 3);
}

#[tokio::test]
async fn test_same_meeting_twice_yields_one_row() {
    let (_dir, pool) = create_test_db().await;
    let ingestor = ingestor(council_source(), &pool, 25);

    ingestor.ingest_as_of(None, None, today()).await.unwrap();
    ingestor.ingest_as_of(None, None, today()).await.unwrap();

    let all = meetings::list_all(&pool).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].body_name, "City Council");
    assert_eq!(all[0].meeting_date.to_string(), "2024-03-01");
    assert_eq!(documents::query_by_meeting(&pool, &all[0].meeting_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_changed_item_gets_new_hash_and_message() {
    let (_dir, pool) = create_test_db().await;
    let source = council_source();
    let ingestor = ingestor(Arc::clone(&source), &pool, 25);

    ingestor.ingest_as_of(None, None, today()).await.unwrap();
    let meeting = meetings::list_all(&pool).await.unwrap().remove(0);
    let before = items::query_by_meeting(&pool, &meeting.meeting_id).await.unwrap();

    source.set_items(
        101,
        vec![
            raw_item(1, 1, "Housing Policy Update (revised)"),
            raw_item(2, 2, "Road Repair Contract"),
            raw_item(3, 3, "Budget Amendment"),
        ],
    );
    let (_, report) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert_eq!(report.items_changed, 1);
    assert_eq!(report.items_unchanged, 2);
    assert_eq!(report.messages_enqueued, 1);

    let after = items::query_by_meeting(&pool, &meeting.meeting_id).await.unwrap();
    assert_eq!(before[0].item_id, after[0].item_id);
    assert_ne!(before[0].content_hash, after[0].content_hash);
    assert_eq!(before[1].content_hash, after[1].content_hash);
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let (_dir, pool) = create_test_db().await;
    let source = council_source();
    // No body name: must not be defaulted
    source.add_event(
        json!({ "EventId": 102, "EventBodyName": "  ", "EventDate": "2024-03-02T00:00:00" }),
        vec![raw_item(9, 1, "Orphan")],
    );
    source.add_event(
        raw_event(103, "Plan Commission", "2024-03-03"),
        vec![
            raw_item(10, 1, "Zoning Variance"),
            raw_item(11, 2, "   "),
            json!({ "EventItemId": 12, "EventItemTitle": 42 }),
        ],
    );
    let ingestor = ingestor(source, &pool, 25);

    let (_, report) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert_eq!(report.events_fetched, 3);
    assert_eq!(report.meetings_new, 2);
    assert_eq!(report.items_skipped_blank, 1);
    assert_eq!(report.records_malformed, 2);
    assert_eq!(report.items_new, 4);
    assert!(!report.is_incomplete());
    assert_eq!(meetings::count(&pool).await.unwrap(), 2);
}

#[tokio::test]
async fn test_event_fetch_failure_keeps_cursor() {
    let (_dir, pool) = create_test_db().await;
    let source = council_source();
    source.fail_events(10, || SourceError::Http {
        status: 503,
        body: "maintenance".to_string(),
    });
    let ingestor = ingestor(Arc::clone(&source), &pool, 25);
    let start: IngestCursor = "2024-02-20:50".parse().unwrap();

    let (cursor, report) = ingestor.ingest_as_of(Some(start), None, today()).await.unwrap();

    assert_eq!(cursor, Some(start));
    assert!(report.abandoned.is_some());
    assert!(report.is_incomplete());
    // Bounded by max_fetch_attempts
    assert_eq!(source.event_fetches.load(Ordering::SeqCst), 3);
    assert_eq!(meetings::count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_fetch_failure_is_retried() {
    let (_dir, pool) = create_test_db().await;
    let source = council_source();
    source.fail_events(1, || SourceError::Timeout);
    source.fail_items(101, 1, || SourceError::Http {
        status: 429,
        body: String::new(),
    });
    let ingestor = ingestor(Arc::clone(&source), &pool, 25);

    let (_, report) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert!(!report.is_incomplete());
    assert_eq!(report.items_new, 3);
    assert_eq!(source.event_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_item_fetch_exhaustion_halts_batch() {
    let (_dir, pool) = create_test_db().await;
    let source = council_source();
    source.add_event(raw_event(102, "Parks Board", "2024-03-02"), vec![raw_item(20, 1, "Trail Plan")]);
    source.fail_items(102, 10, || SourceError::Network("connection reset".to_string()));
    let ingestor = ingestor(source, &pool, 25);

    let (cursor, report) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert!(cursor.is_none());
    assert!(report.abandoned.is_some());
    assert!(!report.window_exhausted);
    // The first meeting was fully written before the failure
    assert_eq!(report.items_new, 3);
}

#[tokio::test]
async fn test_rejected_item_fetch_skips_only_that_event() {
    let (_dir, pool) = create_test_db().await;
    let source = council_source();
    source.add_event(raw_event(102, "Parks Board", "2024-03-02"), vec![raw_item(20, 1, "Trail Plan")]);
    source.fail_items(101, 1, || SourceError::Http {
        status: 404,
        body: "not found".to_string(),
    });
    let ingestor = ingestor(source, &pool, 25);

    let (_, report) = ingestor.ingest_as_of(None, None, today()).await.unwrap();

    assert!(!report.is_incomplete());
    assert_eq!(report.records_malformed, 1);
    assert_eq!(report.meetings_new, 1);
    assert_eq!(report.items_new, 1);
}

/// Two meetings on a one-day page so a completed batch would advance the cursor
fn two_meeting_source() -> Arc<FakeSource> {
    let source = council_source();
    source.add_event(raw_event(102, "Parks Board", "2024-03-02"), vec![raw_item(20, 1, "Trail Plan")]);
    source
}

#[tokio::test]
async fn test_expired_deadline_keeps_starting_cursor() {
    let (_dir, pool) = create_test_db().await;
    let ingestor = ingestor(two_meeting_source(), &pool, 2);
    let start: IngestCursor = "2024-02-20:50".parse().unwrap();

    let (cursor, report) = ingestor
        .ingest_as_of(Some(start), Some(Instant::now()), today())
        .await
        .unwrap();

    assert_eq!(cursor, Some(start));
    assert!(report.deadline_exceeded);
    assert!(report.is_incomplete());
    assert_eq!(meetings::count(&pool).await.unwrap(), 0);
    assert_eq!(test_queue(&pool).stats().await.unwrap().visible, 0);
}

#[tokio::test]
async fn test_deadline_during_event_fetch_keeps_cursor() {
    let (_dir, pool) = create_test_db().await;
    let source = two_meeting_source();
    source.slow_events(Duration::from_secs(5));
    let ingestor = ingestor(Arc::clone(&source), &pool, 2);
    let start: IngestCursor = "2024-02-20:50".parse().unwrap();
    let deadline = Instant::now() + Duration::from_millis(50);

    let (cursor, report) = ingestor.ingest_as_of(Some(start), Some(deadline), today()).await.unwrap();

    assert_eq!(cursor, Some(start));
    assert!(report.deadline_exceeded);
    assert_eq!(report.events_fetched, 0);
    assert_eq!(source.event_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_deadline_during_item_fetch_keeps_cursor() {
    let (_dir, pool) = create_test_db().await;
    let source = two_meeting_source();
    source.slow_items(Duration::from_secs(5));
    let ingestor = ingestor(Arc::clone(&source), &pool, 2);
    let start: IngestCursor = "2024-02-20:50".parse().unwrap();
    let deadline = Instant::now() + Duration::from_millis(50);

    let (cursor, report) = ingestor.ingest_as_of(Some(start), Some(deadline), today()).await.unwrap();

    assert_eq!(cursor, Some(start));
    assert!(report.deadline_exceeded);
    assert!(!report.window_exhausted);
    assert_eq!(report.events_fetched, 2);
    assert_eq!(source.item_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(meetings::count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_full_page_advances_cursor_and_short_page_resets_it() {
    let (_dir, pool) = create_test_db().await;
    let source = Arc::new(FakeSource::new());
    source.add_event(raw_event(201, "City Council", "2024-03-01"), vec![raw_item(1, 1, "A")]);
    source.add_event(raw_event(202, "City Council", "2024-03-01"), vec![raw_item(2, 1, "B")]);
    source.add_event(raw_event(203, "Parks Board", "2024-03-04"), vec![raw_item(3, 1, "C")]);
    let ingestor = ingestor(source, &pool, 2);

    let (cursor, first) = ingestor.ingest_as_of(None, None, today()).await.unwrap();
    assert_eq!(first.events_fetched, 2);
    assert!(!first.window_exhausted);
    assert_eq!(cursor.map(|c| c.to_string()), Some("2024-03-01:202".to_string()));

    let (cursor, second) = ingestor.ingest_as_of(cursor, None, today()).await.unwrap();
    assert_eq!(second.events_fetched, 1);
    assert!(second.window_exhausted);
    assert!(cursor.is_none());
    assert_eq!(meetings::count(&pool).await.unwrap(), 3);
}

#[tokio::test]
async fn test_cursor_persists_between_invocations() {
    let (_dir, pool) = create_test_db().await;
    let cursor: IngestCursor = "2024-03-01:202".parse().unwrap();
    let token = cursor.to_string();

    cursors::save_cursor(&pool, "fake", Some(token.as_str())).await.unwrap();
    let loaded = cursors::load_cursor(&pool, "fake").await.unwrap();
    assert_eq!(loaded.as_deref().map(str::parse::<IngestCursor>).transpose().unwrap(), Some(cursor));

    cursors::save_cursor(&pool, "fake", None).await.unwrap();
    assert!(cursors::load_cursor(&pool, "fake").await.unwrap().is_none());
}
