//! Shared test fixtures: temp database, in-memory source and provider fakes

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use spb_common::db::init_database;
use spb_common::events::EventBus;
use spb_common::models::{canonical_topic, ImpactLevel, ItemEnrichment};
use spb_engine::queue::WorkQueue;
use spb_engine::services::normalizer::{event_position, EventPosition};
use spb_engine::services::{
    Deduplicator, EnrichmentProvider, EnrichmentRequest, IngestConfig, Ingestor, MeetingSource,
    ProviderError, SourceError,
};
use spb_engine::utils::BackoffPolicy;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// "Today" used by ingest tests: every fixture meeting is in the lookback window
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
}

/// Create a file-backed database with the full schema
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("spb_test.db")).await.unwrap();
    (temp_dir, pool)
}

pub fn test_queue(pool: &SqlitePool) -> WorkQueue {
    WorkQueue::new(pool.clone(), Duration::from_secs(300), Duration::from_secs(30))
}

/// Fetch policy with millisecond delays so retry paths stay fast
pub fn fast_ingest_config(batch_size: u32) -> IngestConfig {
    IngestConfig {
        batch_size,
        lookback_days: 30,
        fetch_policy: BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
    }
}

pub fn ingestor(source: Arc<FakeSource>, pool: &SqlitePool, batch_size: u32) -> Ingestor {
    Ingestor::new(
        source,
        Deduplicator::new(pool.clone()),
        EventBus::default(),
        fast_ingest_config(batch_size),
    )
}

pub fn raw_event(event_id: i64, body: &str, date: &str) -> Value {
    json!({
        "EventId": event_id,
        "EventBodyName": body,
        "EventDate": format!("{}T00:00:00", date),
        "EventTime": "6:00 PM",
        "EventLocation": "Council Chambers",
        "EventAgendaFile": format!("https://example.test/agenda/{}.pdf", event_id),
        "EventMinutesFile": null,
        "EventAgendaStatusName": "Final",
        "EventMinutesStatusName": "Draft",
        "EventInSiteURL": null
    })
}

pub fn raw_item(item_id: i64, sequence: i64, title: &str) -> Value {
    json!({
        "EventItemId": item_id,
        "EventItemTitle": title,
        "EventItemAgendaSequence": sequence,
        "EventItemAgendaNote": null,
        "EventItemActionName": null,
        "EventItemMatterName": null,
        "EventItemMatterType": null,
        "EventItemMatterFile": null
    })
}

/// In-memory Legistar stand-in honoring the window/keyset/limit contract
#[derive(Default)]
pub struct FakeSource {
    events: Mutex<Vec<Value>>,
    items: Mutex<HashMap<i64, Vec<Value>>>,
    event_failures: Mutex<VecDeque<SourceError>>,
    item_failures: Mutex<HashMap<i64, VecDeque<SourceError>>>,
    event_delay: Mutex<Duration>,
    item_delay: Mutex<Duration>,
    pub event_fetches: AtomicUsize,
    pub item_fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, event: Value, items: Vec<Value>) {
        let event_id = event["EventId"].as_i64().unwrap_or_default();
        self.events.lock().unwrap().push(event);
        self.items.lock().unwrap().insert(event_id, items);
    }

    pub fn set_items(&self, event_id: i64, items: Vec<Value>) {
        self.items.lock().unwrap().insert(event_id, items);
    }

    /// The next `times` event fetches fail with errors built by `make`
    pub fn fail_events(&self, times: usize, make: impl Fn() -> SourceError) {
        let mut failures = self.event_failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(make());
        }
    }

    pub fn fail_items(&self, event_id: i64, times: usize, make: impl Fn() -> SourceError) {
        let mut failures = self.item_failures.lock().unwrap();
        let queue = failures.entry(event_id).or_default();
        for _ in 0..times {
            queue.push_back(make());
        }
    }

    /// Every event fetch takes at least `delay`
    pub fn slow_events(&self, delay: Duration) {
        *self.event_delay.lock().unwrap() = delay;
    }

    pub fn slow_items(&self, delay: Duration) {
        *self.item_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl MeetingSource for FakeSource {
    fn source_name(&self) -> &str {
        "fake"
    }

    async fn fetch_events(
        &self,
        window_start: NaiveDate,
        after: Option<EventPosition>,
        limit: u32,
    ) -> Result<Vec<Value>, SourceError> {
        self.event_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.event_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.event_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let events = self.events.lock().unwrap();
        let mut page: Vec<(Option<EventPosition>, Value)> = events
            .iter()
            .map(|event| (event_position(event), event.clone()))
            .filter(|(position, _)| match position {
                // Malformed records still come back from the source
                None => after.is_none(),
                Some(position) => position.date >= window_start && after.map_or(true, |a| *position > a),
            })
            .collect();
        page.sort_by_key(|(position, _)| *position);
        Ok(page.into_iter().take(limit as usize).map(|(_, event)| event).collect())
    }

    async fn fetch_event_items(&self, event_id: i64) -> Result<Vec<Value>, SourceError> {
        self.item_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.item_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self
            .item_failures
            .lock()
            .unwrap()
            .get_mut(&event_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(self.items.lock().unwrap().get(&event_id).cloned().unwrap_or_default())
    }
}

/// Scripted enrichment provider that counts calls
pub struct FakeProvider {
    scripted: Mutex<VecDeque<Result<ItemEnrichment, ProviderError>>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    /// Always succeeds (after the scripted results are used up)
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_result(&self, result: Result<ItemEnrichment, ProviderError>) {
        self.scripted.lock().unwrap().push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Deterministic enrichment derived from the item title
pub fn enrichment_for(title: &str) -> ItemEnrichment {
    let topic = if title.to_lowercase().contains("housing") {
        "housing"
    } else {
        canonical_topic(title)
    };
    ItemEnrichment {
        summary: format!("Council considers {}.", title),
        impact_level: ImpactLevel::Medium,
        relevance: 3.0,
        primary_topic: topic.to_string(),
        topics: BTreeSet::from([topic.to_string()]),
    }
}

#[async_trait]
impl EnrichmentProvider for FakeProvider {
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<ItemEnrichment, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(enrichment_for(&request.title)))
    }
}
