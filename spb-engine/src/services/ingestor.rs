//! Ingestor
//!
//! One invocation pulls a bounded batch of events from the meeting source,
//! normalizes them, writes what changed through the [`Deduplicator`] and
//! returns the cursor to resume from. The cursor only advances when every
//! write in the batch succeeded; anything less returns the cursor the call
//! started with, and re-processing is safe because writes are keyed by
//! derived identity and guarded by content hash.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use spb_common::config::SourceConfig;
use spb_common::events::{BriefEvent, EventBus};
use spb_common::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::dedup::{DedupOutcome, Deduplicator};
use super::legistar_client::{MeetingSource, SourceError};
use super::normalizer::{self, EventPosition};
use crate::utils::{retry_with_backoff, BackoffPolicy, RetryOutcome};

/// Opaque resumption token: the last fully processed `(EventDate, EventId)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestCursor {
    pub position: EventPosition,
}

impl IngestCursor {
    pub fn new(position: EventPosition) -> Self {
        Self { position }
    }
}

impl fmt::Display for IngestCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position.date.format("%Y-%m-%d"), self.position.event_id)
    }
}

impl FromStr for IngestCursor {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Invalid ingest cursor '{}'", token));
        let (date, event_id) = token.split_once(':').ok_or_else(invalid)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
        let event_id = event_id.parse::<i64>().map_err(|_| invalid())?;
        Ok(Self::new(EventPosition { date, event_id }))
    }
}

/// Batch sizing and fetch retry policy
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub batch_size: u32,
    pub lookback_days: u32,
    pub fetch_policy: BackoffPolicy,
}

impl From<&SourceConfig> for IngestConfig {
    fn from(config: &SourceConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            lookback_days: config.lookback_days,
            fetch_policy: BackoffPolicy::new(
                config.max_fetch_attempts,
                Duration::from_millis(config.initial_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
        }
    }
}

/// Summary of one ingest invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub events_fetched: usize,
    pub meetings_new: usize,
    pub meetings_changed: usize,
    pub meetings_unchanged: usize,
    pub documents_written: usize,
    pub items_new: usize,
    pub items_changed: usize,
    pub items_unchanged: usize,
    pub items_skipped_blank: usize,
    /// Events and items skipped as malformed
    pub records_malformed: usize,
    pub messages_enqueued: usize,
    /// Set when fetch retries ran out and the batch was abandoned
    pub abandoned: Option<String>,
    pub deadline_exceeded: bool,
    /// The source returned a short page: the lookback window is fully read
    pub window_exhausted: bool,
}

impl IngestReport {
    /// True when the cursor was held back
    pub fn is_incomplete(&self) -> bool {
        self.abandoned.is_some() || self.deadline_exceeded
    }
}

/// How processing a single event ended
enum EventFlow {
    Continue,
    /// Stop the batch and keep the starting cursor
    Halt,
}

pub struct Ingestor {
    source: Arc<dyn MeetingSource>,
    dedup: Deduplicator,
    events: EventBus,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(source: Arc<dyn MeetingSource>, dedup: Deduplicator, events: EventBus, config: IngestConfig) -> Self {
        Self {
            source,
            dedup,
            events,
            config,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.source_name()
    }

    /// Ingest one batch after `cursor` (or from the lookback window start)
    ///
    /// Only store failures are returned as `Err`. Source failures and deadline
    /// expiry are reported in the [`IngestReport`] with the cursor unchanged.
    pub async fn ingest(
        &self,
        cursor: Option<IngestCursor>,
        deadline: Option<Instant>,
    ) -> Result<(Option<IngestCursor>, IngestReport)> {
        self.ingest_as_of(cursor, deadline, Utc::now().date_naive()).await
    }

    /// [`Ingestor::ingest`] with an explicit "today" (drives lookback and meeting status)
    pub async fn ingest_as_of(
        &self,
        cursor: Option<IngestCursor>,
        deadline: Option<Instant>,
        today: NaiveDate,
    ) -> Result<(Option<IngestCursor>, IngestReport)> {
        let mut report = IngestReport::default();
        let window_start = today - ChronoDuration::days(i64::from(self.config.lookback_days));
        let after = cursor.map(|c| c.position);

        tracing::info!(
            source = self.source_name(),
            cursor = %cursor.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
            window_start = %window_start,
            batch_size = self.config.batch_size,
            "Starting ingest"
        );

        let source = &self.source;
        let batch_size = self.config.batch_size;
        let outcome = retry_with_backoff(
            "legistar_fetch_events",
            self.config.fetch_policy,
            deadline,
            SourceError::is_retryable,
            || source.fetch_events(window_start, after, batch_size),
        )
        .await;

        let records = match outcome {
            RetryOutcome::Success(records) => records,
            RetryOutcome::Fatal(e) | RetryOutcome::Exhausted { last_error: e, .. } => {
                tracing::error!(error = %e, "Event fetch failed, batch abandoned");
                report.abandoned = Some(e.to_string());
                return Ok(self.finish(cursor, report));
            }
            RetryOutcome::DeadlineExceeded { .. } => {
                report.deadline_exceeded = true;
                return Ok(self.finish(cursor, report));
            }
        };
        report.events_fetched = records.len();

        let mut last_position = after;
        for raw in &records {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!("Ingest deadline reached mid-batch");
                report.deadline_exceeded = true;
                return Ok(self.finish(cursor, report));
            }

            if let EventFlow::Halt = self.ingest_event(raw, today, deadline, &mut report).await? {
                return Ok(self.finish(cursor, report));
            }

            if let Some(position) = normalizer::event_position(raw) {
                last_position = last_position.max(Some(position));
            }
        }

        let next = if records.len() < batch_size as usize {
            report.window_exhausted = true;
            None
        } else {
            last_position.map(IngestCursor::new)
        };

        Ok(self.finish(next, report))
    }

    async fn ingest_event(
        &self,
        raw: &Value,
        today: NaiveDate,
        deadline: Option<Instant>,
        report: &mut IngestReport,
    ) -> Result<EventFlow> {
        let normalized = match normalizer::parse_event(raw).and_then(|event| normalizer::normalize_meeting(&event, today)) {
            Ok(normalized) => normalized,
            Err(e) => {
                tracing::warn!(
                    event_id = ?raw.get("EventId"),
                    error = %e,
                    "Skipping malformed event record"
                );
                report.records_malformed += 1;
                return Ok(EventFlow::Continue);
            }
        };
        let meeting = &normalized.meeting;

        // source_event_id is always set by normalization
        let event_id = meeting.source_event_id.unwrap_or_default();
        let source = &self.source;
        let outcome = retry_with_backoff(
            "legistar_fetch_event_items",
            self.config.fetch_policy,
            deadline,
            SourceError::is_retryable,
            || source.fetch_event_items(event_id),
        )
        .await;

        let raw_items = match outcome {
            RetryOutcome::Success(raw_items) => raw_items,
            RetryOutcome::Fatal(e) => {
                tracing::warn!(event_id, error = %e, "Skipping event: items rejected by source");
                report.records_malformed += 1;
                return Ok(EventFlow::Continue);
            }
            RetryOutcome::Exhausted { last_error, .. } => {
                tracing::error!(event_id, error = %last_error, "Item fetch failed, batch abandoned");
                report.abandoned = Some(last_error.to_string());
                return Ok(EventFlow::Halt);
            }
            RetryOutcome::DeadlineExceeded { .. } => {
                report.deadline_exceeded = true;
                return Ok(EventFlow::Halt);
            }
        };

        // Meeting first, so items normally find a real parent row
        match self.dedup.apply_meeting(meeting).await? {
            DedupOutcome::New => report.meetings_new += 1,
            DedupOutcome::Changed => report.meetings_changed += 1,
            DedupOutcome::Unchanged => report.meetings_unchanged += 1,
        }
        report.documents_written += self.dedup.apply_documents(&normalized.documents).await?;

        let items = normalizer::normalize_items(meeting, &raw_items);
        report.items_skipped_blank += items.skipped_blank;
        report.records_malformed += items.malformed;

        for item in &items.items {
            let applied = self.dedup.apply_item(meeting, item).await?;
            match applied.outcome {
                DedupOutcome::New => report.items_new += 1,
                DedupOutcome::Changed => report.items_changed += 1,
                DedupOutcome::Unchanged => report.items_unchanged += 1,
            }
            if applied.message.is_some() {
                report.messages_enqueued += 1;
            }
        }

        Ok(EventFlow::Continue)
    }

    fn finish(&self, cursor: Option<IngestCursor>, report: IngestReport) -> (Option<IngestCursor>, IngestReport) {
        tracing::info!(
            source = self.source_name(),
            events = report.events_fetched,
            meetings_written = report.meetings_new + report.meetings_changed,
            items_written = report.items_new + report.items_changed,
            enqueued = report.messages_enqueued,
            malformed = report.records_malformed,
            incomplete = report.is_incomplete(),
            next_cursor = %cursor.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
            "Ingest finished"
        );

        self.events.emit_lossy(BriefEvent::IngestCompleted {
            meetings_written: report.meetings_new + report.meetings_changed,
            items_written: report.items_new + report.items_changed,
            messages_enqueued: report.messages_enqueued,
            abandoned: report.is_incomplete(),
            timestamp: Utc::now(),
        });

        (cursor, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_token_round_trip() {
        let cursor: IngestCursor = "2024-03-01:1234".parse().unwrap();
        assert_eq!(cursor.position.event_id, 1234);
        assert_eq!(cursor.to_string(), "2024-03-01:1234");
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!("".parse::<IngestCursor>().is_err());
        assert!("2024-03-01".parse::<IngestCursor>().is_err());
        assert!("yesterday:12".parse::<IngestCursor>().is_err());
        assert!("2024-03-01:abc".parse::<IngestCursor>().is_err());
    }

    #[test]
    fn test_config_from_source_section() {
        let config = IngestConfig::from(&SourceConfig::default());
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.fetch_policy.max_attempts, 4);
        assert_eq!(config.fetch_policy.delay_after(1), Duration::from_millis(500));
    }
}
