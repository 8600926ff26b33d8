//! Search engine: snapshot holder and refresher
//!
//! Queries clone the current `Arc<SearchIndex>` under a read lock that is
//! held only for the clone, so a rebuild (which scans the store without any
//! lock) never blocks in-flight queries. The write lock is taken only to swap.

use chrono::Utc;
use spb_common::events::{BriefEvent, EventBus};
use spb_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::index::{SearchFilters, SearchHit, SearchIndex, SearchStats};
use crate::db::{items, meetings};

/// Quiet period after pipeline activity before an early rebuild
const REFRESH_DEBOUNCE: Duration = Duration::from_secs(2);

struct Snapshot {
    index: Arc<SearchIndex>,
    built: Instant,
}

pub struct SearchEngine {
    pool: SqlitePool,
    events: EventBus,
    refresh_interval: Duration,
    snapshot: RwLock<Snapshot>,
}

impl SearchEngine {
    /// Build the initial snapshot from the store
    pub async fn open(pool: SqlitePool, events: EventBus, refresh_interval: Duration) -> Result<Self> {
        let engine = Self {
            pool,
            events,
            refresh_interval,
            snapshot: RwLock::new(Snapshot {
                index: Arc::new(SearchIndex::empty()),
                built: Instant::now(),
            }),
        };
        engine.refresh().await?;
        Ok(engine)
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<SearchIndex> {
        Arc::clone(&self.snapshot.read().await.index)
    }

    pub async fn search(&self, query: &str, filters: &SearchFilters, limit: usize) -> Vec<SearchHit> {
        let index = self.snapshot().await;
        let hits = index.search(query, filters, limit);
        tracing::debug!(query, hits = hits.len(), "Search executed");
        hits
    }

    pub async fn stats(&self) -> SearchStats {
        self.snapshot().await.stats()
    }

    /// Rebuild from a full store scan and swap the new snapshot in
    pub async fn refresh(&self) -> Result<SearchStats> {
        let started = Instant::now();
        let all_meetings = meetings::list_all(&self.pool).await?;
        let all_items = items::list_all(&self.pool).await?;
        let index = Arc::new(SearchIndex::build(&all_meetings, &all_items));
        let stats = index.stats();

        {
            let mut snapshot = self.snapshot.write().await;
            *snapshot = Snapshot {
                index,
                built: Instant::now(),
            };
        }

        tracing::info!(
            items = stats.indexed_items,
            vocabulary = stats.vocabulary_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Search index refreshed"
        );

        self.events.emit_lossy(BriefEvent::IndexRefreshed {
            indexed_items: stats.indexed_items,
            timestamp: Utc::now(),
        });

        Ok(stats)
    }

    /// Rebuild only if the snapshot is older than the refresh interval
    pub async fn refresh_if_stale(&self) -> Result<bool> {
        let age = self.snapshot.read().await.built.elapsed();
        if age < self.refresh_interval {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }

    /// Background task: periodic refresh plus an early rebuild shortly after
    /// ingest or enrichment activity
    pub fn spawn_refresher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut events = engine.events.subscribe();
        let interval = engine.refresh_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut dirty_since: Option<Instant> = None;
            let mut events_open = true;

            loop {
                let settle_at = dirty_since.map(|t| t + REFRESH_DEBOUNCE);
                let built = engine.snapshot.read().await.built;
                let stale_at = built
                    .checked_add(interval)
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(stale_at) => {
                        if let Err(e) = engine.refresh().await {
                            tracing::error!(error = %e, "Periodic search refresh failed");
                        }
                    }
                    _ = sleep_until_opt(settle_at) => {
                        dirty_since = None;
                        if let Err(e) = engine.refresh().await {
                            tracing::error!(error = %e, "Search refresh after pipeline activity failed");
                        }
                    }
                    received = events.recv(), if events_open => match received {
                        Ok(BriefEvent::ItemEnriched { .. }) => {
                            dirty_since.get_or_insert_with(Instant::now);
                        }
                        Ok(BriefEvent::IngestCompleted { items_written, .. }) if items_written > 0 => {
                            dirty_since.get_or_insert_with(Instant::now);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Search refresher lagged behind events");
                            dirty_since.get_or_insert_with(Instant::now);
                        }
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    },
                }
            }

            tracing::debug!("Search refresher stopped");
        })
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
