//! Search over a store populated by the real ingest and analyzer path

mod helpers;

use helpers::*;
use spb_common::events::EventBus;
use spb_engine::search::{SearchEngine, SearchFilters};
use spb_engine::services::{Analyzer, AnalyzerPool, PoolConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_housing_query_ranks_title_match_first() {
    let (_dir, pool) = create_test_db().await;
    let source = Arc::new(FakeSource::new());
    source.add_event(
        raw_event(101, "City Council", "2024-03-01"),
        vec![
            raw_item(1, 1, "Affordable Housing Ordinance"),
            raw_item(2, 2, "Road Repair Contract"),
            raw_item(3, 3, "Library Hours"),
        ],
    );
    source.add_event(
        raw_event(102, "Plan Commission", "2024-03-05"),
        vec![raw_item(4, 1, "Housing Density Study")],
    );
    ingestor(source, &pool, 25).ingest_as_of(None, None, today()).await.unwrap();

    let events = EventBus::default();
    let analyzer = Arc::new(Analyzer::new(pool.clone(), Arc::new(FakeProvider::new()), events.clone(), 3));
    let analyzer_pool = Arc::new(AnalyzerPool::new(
        analyzer,
        test_queue(&pool),
        events.clone(),
        PoolConfig {
            workers: 2,
            idle_poll: Duration::from_millis(10),
            attempt_deadline: Duration::from_secs(5),
        },
    ));
    analyzer_pool.drain().await.unwrap();

    let engine = SearchEngine::open(pool, events, Duration::from_secs(300)).await.unwrap();

    let hits = engine.search("housing", &SearchFilters::default(), 10).await;
    assert_eq!(hits.len(), 2);
    // Equal scores: the newer meeting wins
    assert_eq!(hits[0].title, "Housing Density Study");
    assert_eq!(hits[1].title, "Affordable Housing Ordinance");
    assert!(hits.iter().all(|hit| hit.score > 0.0 && hit.score <= 1.0));

    let filtered = engine
        .search(
            "road",
            &SearchFilters {
                topics: vec!["housing".to_string()],
            },
            10,
        )
        .await;
    assert!(filtered.is_empty());

    assert!(engine.search("", &SearchFilters::default(), 10).await.is_empty());
    assert_eq!(engine.stats().await.indexed_items, 4);
}
