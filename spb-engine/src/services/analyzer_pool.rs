//! Analyzer consumer pool
//!
//! N workers loop receive → process → settle against the shared work queue.
//! Workers coordinate only through the queue's claim and the store's
//! conditional writes, so several pools (in one or many processes) may run
//! against the same database.

use chrono::Utc;
use serde::Serialize;
use spb_common::config::AnalyzerConfig;
use spb_common::events::{BriefEvent, EventBus};
use spb_common::{Error, Result};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::analyzer::{Analyzer, Disposition};
use crate::queue::WorkQueue;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub idle_poll: Duration,
    pub attempt_deadline: Duration,
}

impl From<&AnalyzerConfig> for PoolConfig {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            attempt_deadline: Duration::from_secs(config.attempt_deadline_secs),
        }
    }
}

/// Tally of settled deliveries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Deliveries left unsettled because the store failed
    pub errors: usize,
}

impl PoolReport {
    pub fn processed(&self) -> usize {
        self.acked + self.retried + self.dead_lettered
    }

    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Retry { .. } => self.retried += 1,
            Disposition::DeadLetter { .. } => self.dead_lettered += 1,
        }
    }
}

impl AddAssign for PoolReport {
    fn add_assign(&mut self, other: Self) {
        self.acked += other.acked;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.errors += other.errors;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Stop when no message is visible
    Drain,
    /// Poll until cancelled
    Run,
}

pub struct AnalyzerPool {
    analyzer: Arc<Analyzer>,
    queue: WorkQueue,
    events: EventBus,
    config: PoolConfig,
}

impl AnalyzerPool {
    pub fn new(analyzer: Arc<Analyzer>, queue: WorkQueue, events: EventBus, config: PoolConfig) -> Self {
        Self {
            analyzer,
            queue,
            events,
            config,
        }
    }

    /// Receive, process and settle a single message
    ///
    /// Returns `Ok(None)` when nothing is visible.
    pub async fn process_next(&self) -> Result<Option<Disposition>> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(None);
        };

        let deadline = Instant::now() + self.config.attempt_deadline;
        let disposition = self.analyzer.process(&delivery, Some(deadline)).await?;

        match &disposition {
            Disposition::Ack => {
                self.queue.ack(&delivery.receipt).await?;
            }
            Disposition::Retry { reason } => {
                let delay = self.queue.retry_delay(delivery.receive_count);
                self.queue.retry(&delivery.receipt, delay, reason).await?;
            }
            Disposition::DeadLetter { reason } => {
                if self.queue.dead_letter(&delivery.receipt, reason).await? {
                    tracing::error!(
                        message_id = %delivery.message.message_id,
                        item_id = %delivery.message.item_id,
                        reason = %reason,
                        "Message dead-lettered"
                    );
                    self.events.emit_lossy(BriefEvent::MessageDeadLettered {
                        message_id: delivery.message.message_id.clone(),
                        item_id: delivery.message.item_id.clone(),
                        reason: reason.clone(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        Ok(Some(disposition))
    }

    /// Process until no message is visible
    ///
    /// Messages waiting out a retry delay are left for a later run.
    pub async fn drain(self: &Arc<Self>) -> Result<PoolReport> {
        self.spawn_workers(Mode::Drain, CancellationToken::new()).await
    }

    /// Process until `cancel` fires
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<PoolReport> {
        self.spawn_workers(Mode::Run, cancel).await
    }

    async fn spawn_workers(self: &Arc<Self>, mode: Mode, cancel: CancellationToken) -> Result<PoolReport> {
        tracing::info!(workers = self.config.workers, drain = (mode == Mode::Drain), "Analyzer pool starting");

        let handles: Vec<_> = (0..self.config.workers)
            .map(|worker_id| {
                let pool = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.worker_loop(worker_id, mode, cancel).await })
            })
            .collect();

        let mut report = PoolReport::default();
        let mut first_error = None;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(worker_report)) => report += worker_report,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error.get_or_insert(Error::Internal(format!("Analyzer worker panicked: {}", join_error)));
                }
            }
        }

        tracing::info!(
            acked = report.acked,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            errors = report.errors,
            "Analyzer pool stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn worker_loop(&self, worker_id: usize, mode: Mode, cancel: CancellationToken) -> Result<PoolReport> {
        let mut report = PoolReport::default();

        while !cancel.is_cancelled() {
            match self.process_next().await {
                Ok(Some(disposition)) => report.record(&disposition),
                Ok(None) => {
                    if mode == Mode::Drain {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(worker_id, error = %e, "Store failure while processing message");
                    // A drain cannot make progress against a failing store
                    if mode == Mode::Drain {
                        return Err(e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                    }
                }
            }
        }

        tracing::debug!(worker_id, processed = report.processed(), "Analyzer worker stopped");
        Ok(report)
    }
}
