//! Event types for the SPB event system
//!
//! Provides the BriefEvent enum and an EventBus used to fan out
//! ingestion/analysis activity to in-process listeners (the search refresher).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// SPB event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BriefEvent {
    /// An ingestion invocation finished (successfully or abandoned)
    IngestCompleted {
        meetings_written: usize,
        items_written: usize,
        messages_enqueued: usize,
        abandoned: bool,
        timestamp: DateTime<Utc>,
    },

    /// Enrichment was durably applied to an agenda item
    ItemEnriched {
        item_id: String,
        meeting_id: String,
        analysis_version: i64,
        timestamp: DateTime<Utc>,
    },

    /// A work message was moved out of the live queue
    MessageDeadLettered {
        message_id: String,
        item_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The search index snapshot was swapped
    IndexRefreshed {
        indexed_items: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`BriefEvent`]
///
/// Cloning is cheap; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BriefEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<BriefEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: BriefEvent) -> Result<usize, broadcast::error::SendError<BriefEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: BriefEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
