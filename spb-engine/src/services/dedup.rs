//! Dedup/versioning layer
//!
//! Compares freshly normalized records against stored content hashes and
//! writes only what changed. An item write and its enrichment message commit
//! in one transaction, so a changed item can never be stored without work
//! being queued for it (and vice versa).

use spb_common::models::{AgendaItem, Document, Meeting};
use spb_common::Result;
use sqlx::SqlitePool;

use crate::db::{documents, items, meetings};
use crate::queue::{enqueue_with, WorkMessage};
use crate::utils::{begin_monitored, max_lock_wait_ms, retry_on_lock};

/// What dedup decided for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; written
    New,
    /// Content hash differs from the stored one; rewritten
    Changed,
    /// Stored hash matches; nothing written
    Unchanged,
}

/// Result of applying one agenda item
#[derive(Debug, Clone)]
pub struct ItemApplied {
    pub outcome: DedupOutcome,
    /// Enrichment message enqueued alongside the write
    pub message: Option<WorkMessage>,
}

pub struct Deduplicator {
    pool: SqlitePool,
}

impl Deduplicator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write a meeting if new or changed
    pub async fn apply_meeting(&self, meeting: &Meeting) -> Result<DedupOutcome> {
        let stored = meetings::get_meeting(&self.pool, &meeting.meeting_id).await?;
        let existed = match &stored {
            Some(stored) if stored.content_hash == meeting.content_hash => {
                tracing::trace!(meeting_id = %meeting.meeting_id, "Meeting unchanged");
                return Ok(DedupOutcome::Unchanged);
            }
            // A placeholder only exists to satisfy item references
            Some(stored) => !stored.is_placeholder(),
            None => false,
        };

        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;
        let written = retry_on_lock("dedup_apply_meeting", max_wait_ms, || async {
            meetings::upsert_meeting(pool, meeting).await
        })
        .await?;

        // A concurrent ingest may have written the same content first
        let outcome = match (written, existed) {
            (false, _) => DedupOutcome::Unchanged,
            (true, false) => DedupOutcome::New,
            (true, true) => DedupOutcome::Changed,
        };

        tracing::debug!(
            meeting_id = %meeting.meeting_id,
            body = %meeting.body_name,
            date = %meeting.meeting_date,
            outcome = ?outcome,
            "Meeting applied"
        );

        Ok(outcome)
    }

    /// Write document references; returns how many rows changed
    pub async fn apply_documents(&self, docs: &[Document]) -> Result<usize> {
        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;
        let mut written = 0;

        for doc in docs {
            let changed = retry_on_lock("dedup_apply_document", max_wait_ms, || async {
                documents::upsert_document(pool, doc).await
            })
            .await?;
            if changed {
                written += 1;
            }
        }

        Ok(written)
    }

    /// Write an agenda item if new or changed and enqueue its enrichment
    ///
    /// `meeting` supplies the placeholder row when the item's meeting is not
    /// yet durably visible.
    pub async fn apply_item(&self, meeting: &Meeting, item: &AgendaItem) -> Result<ItemApplied> {
        let stored_hash = items::get_content_hash(&self.pool, &item.item_id).await?;
        if stored_hash.as_deref() == Some(item.content_hash.as_str()) {
            return Ok(ItemApplied {
                outcome: DedupOutcome::Unchanged,
                message: None,
            });
        }

        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;

        let message = retry_on_lock("dedup_apply_item", max_wait_ms, || async {
            let mut tx = begin_monitored(pool, "dedup::apply_item").await?;

            meetings::ensure_meeting(tx.conn()?, &meeting.meeting_id, &meeting.body_name, meeting.meeting_date)
                .await?;

            let changed = items::upsert_item(tx.conn()?, item).await?;
            let message = if changed {
                Some(enqueue_with(tx.conn()?, &item.item_id, &item.content_hash).await?)
            } else {
                None
            };

            tx.commit().await?;
            Ok(message)
        })
        .await?;

        let outcome = match (&message, stored_hash.is_some()) {
            (None, _) => DedupOutcome::Unchanged,
            (Some(_), false) => DedupOutcome::New,
            (Some(_), true) => DedupOutcome::Changed,
        };

        if let Some(message) = &message {
            tracing::debug!(
                item_id = %item.item_id,
                message_id = %message.message_id,
                outcome = ?outcome,
                "Agenda item written, enrichment enqueued"
            );
        }

        Ok(ItemApplied { outcome, message })
    }
}
