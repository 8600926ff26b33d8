//! Analyzer: one enrichment attempt per delivery
//!
//! A delivery is a trigger to re-check, not proof that work is needed. The
//! stored item decides: superseded content and already-enriched content are
//! acknowledged without calling the provider, and the final write is guarded
//! by the content hash the enrichment was computed from.

use chrono::Utc;
use spb_common::events::{BriefEvent, EventBus};
use spb_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::time::Instant;

use super::enrichment_client::{EnrichmentProvider, EnrichmentRequest, ProviderError};
use crate::db::items::{self, ConditionalUpdate};
use crate::db::meetings;
use crate::queue::Delivery;

/// What the queue should do with a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Settled: applied, already applied, or superseded
    Ack,
    /// Transient failure; redeliver later
    Retry { reason: String },
    /// Park for manual inspection
    DeadLetter { reason: String },
}

pub struct Analyzer {
    pool: SqlitePool,
    provider: Arc<dyn EnrichmentProvider>,
    events: EventBus,
    max_receives: u32,
}

impl Analyzer {
    pub fn new(pool: SqlitePool, provider: Arc<dyn EnrichmentProvider>, events: EventBus, max_receives: u32) -> Self {
        Self {
            pool,
            provider,
            events,
            max_receives: max_receives.max(1),
        }
    }

    /// Process one delivery
    ///
    /// Store failures are returned as `Err`; the caller must leave the
    /// message unacknowledged so it is redelivered after its visibility window.
    pub async fn process(&self, delivery: &Delivery, deadline: Option<Instant>) -> Result<Disposition> {
        let message = &delivery.message;

        let Some(item) = items::get_item(&self.pool, &message.item_id).await? else {
            tracing::error!(item_id = %message.item_id, "Work message references a missing item");
            return Ok(Disposition::DeadLetter {
                reason: format!("agenda item {} not found", message.item_id),
            });
        };

        if item.content_hash != message.content_hash {
            tracing::debug!(
                item_id = %item.item_id,
                message_hash = %message.content_hash,
                stored_hash = %item.content_hash,
                "Message superseded by newer content"
            );
            return Ok(Disposition::Ack);
        }

        if item.last_analyzed_hash.as_deref() == Some(message.content_hash.as_str()) {
            tracing::debug!(item_id = %item.item_id, "Enrichment already applied, skipping provider call");
            // A delivery that failed after its write comes back here; finish its rollup
            meetings::refresh_rollup(&self.pool, &item.meeting_id).await?;
            return Ok(Disposition::Ack);
        }

        let meeting = meetings::get_meeting(&self.pool, &item.meeting_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("meeting {}", item.meeting_id)))?;

        let request = EnrichmentRequest {
            item_id: item.item_id.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            body_name: meeting.body_name.clone(),
            meeting_date: meeting.meeting_date,
        };

        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.provider.enrich(&request))
                .await
                .unwrap_or(Err(ProviderError::Timeout)),
            None => self.provider.enrich(&request).await,
        };

        let enrichment = match result {
            Ok(enrichment) => enrichment,
            Err(e) => return Ok(self.classify_failure(delivery, e)),
        };

        match items::conditional_update_item(&self.pool, &item.item_id, &message.content_hash, &enrichment).await {
            Ok(ConditionalUpdate::Applied { analysis_version }) => {
                meetings::refresh_rollup(&self.pool, &item.meeting_id).await?;

                tracing::info!(
                    item_id = %item.item_id,
                    analysis_version,
                    impact = %enrichment.impact_level,
                    topic = %enrichment.primary_topic,
                    "Enrichment applied"
                );

                self.events.emit_lossy(BriefEvent::ItemEnriched {
                    item_id: item.item_id.clone(),
                    meeting_id: item.meeting_id.clone(),
                    analysis_version,
                    timestamp: Utc::now(),
                });
                Ok(Disposition::Ack)
            }
            Ok(ConditionalUpdate::AlreadyApplied) => {
                tracing::debug!(item_id = %item.item_id, "Concurrent delivery applied enrichment first");
                meetings::refresh_rollup(&self.pool, &item.meeting_id).await?;
                Ok(Disposition::Ack)
            }
            Err(Error::StaleWrite { current_hash, .. }) => {
                tracing::debug!(
                    item_id = %item.item_id,
                    current_hash = %current_hash,
                    "Content changed during enrichment, result discarded"
                );
                Ok(Disposition::Ack)
            }
            Err(e) => Err(e),
        }
    }

    fn classify_failure(&self, delivery: &Delivery, error: ProviderError) -> Disposition {
        let item_id = &delivery.message.item_id;

        if !error.is_retryable() {
            tracing::error!(item_id = %item_id, error = %error, "Provider rejected item, dead-lettering");
            return Disposition::DeadLetter {
                reason: error.to_string(),
            };
        }

        // A slow provider is never grounds for giving up on the item
        if matches!(error, ProviderError::Timeout) {
            tracing::warn!(item_id = %item_id, receive_count = delivery.receive_count, "Enrichment timed out");
            return Disposition::Retry {
                reason: error.to_string(),
            };
        }

        if delivery.receive_count >= self.max_receives {
            tracing::error!(
                item_id = %item_id,
                receive_count = delivery.receive_count,
                error = %error,
                "Retry budget exhausted, dead-lettering"
            );
            return Disposition::DeadLetter {
                reason: format!("{} (after {} deliveries)", error, delivery.receive_count),
            };
        }

        tracing::warn!(
            item_id = %item_id,
            receive_count = delivery.receive_count,
            error = %error,
            "Enrichment failed, will retry"
        );
        Disposition::Retry {
            reason: error.to_string(),
        }
    }
}
