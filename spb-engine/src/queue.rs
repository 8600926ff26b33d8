//! SQLite-backed at-least-once work queue
//!
//! Messages live in the `work_queue` table next to the entities they refer
//! to, so an item write and its enrichment message commit together.
//!
//! Delivery model:
//! - `receive` claims the oldest visible message, hides it for the visibility
//!   timeout, bumps `receive_count` and issues a fresh receipt
//! - a consumer that crashes simply never acks; the message becomes visible
//!   again once the timeout lapses
//! - `ack`/`retry`/`dead_letter` only act on the current receipt, so a
//!   consumer whose delivery was superseded cannot disturb the newer one

use chrono::{DateTime, Utc};
use serde::Serialize;
use spb_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::utils::{max_lock_wait_ms, retry_on_lock};

/// Enrichment trigger for one item at one content version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkMessage {
    pub message_id: String,
    pub item_id: String,
    pub content_hash: String,
    pub enqueued_at: DateTime<Utc>,
}

/// A received message together with its delivery metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: WorkMessage,
    /// 1 on first delivery
    pub receive_count: u32,
    pub receipt: String,
}

/// A message parked for manual inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub message: WorkMessage,
    pub receive_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Deliverable right now
    pub visible: i64,
    /// Received and not yet settled, or waiting out a retry delay
    pub in_flight: i64,
    pub dead: i64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn message_from_row(row: &SqliteRow) -> Result<WorkMessage> {
    let enqueued_at: String = row.get("enqueued_at");
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map_err(|e| Error::Internal(format!("Invalid enqueued_at '{}': {}", enqueued_at, e)))?
        .with_timezone(&Utc);

    Ok(WorkMessage {
        message_id: row.get("message_id"),
        item_id: row.get("item_id"),
        content_hash: row.get("content_hash"),
        enqueued_at,
    })
}

fn receive_count_from_row(row: &SqliteRow) -> u32 {
    let count: i64 = row.get("receive_count");
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Insert a new message on any executor (pool or open transaction)
pub async fn enqueue_with<'e, E>(executor: E, item_id: &str, content_hash: &str) -> Result<WorkMessage>
where
    E: Executor<'e, Database = Sqlite>,
{
    let message = WorkMessage {
        message_id: Uuid::new_v4().to_string(),
        item_id: item_id.to_string(),
        content_hash: content_hash.to_string(),
        enqueued_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO work_queue (message_id, item_id, content_hash, enqueued_at, visible_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.message_id)
    .bind(&message.item_id)
    .bind(&message.content_hash)
    .bind(message.enqueued_at.to_rfc3339())
    .bind(message.enqueued_at.timestamp_millis())
    .execute(executor)
    .await?;

    Ok(message)
}

/// Handle on the shared queue table
#[derive(Clone)]
pub struct WorkQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
    retry_base_delay: Duration,
}

impl WorkQueue {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration, retry_base_delay: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            retry_base_delay,
        }
    }

    pub async fn enqueue(&self, item_id: &str, content_hash: &str) -> Result<WorkMessage> {
        let message = enqueue_with(&self.pool, item_id, content_hash).await?;
        tracing::debug!(message_id = %message.message_id, item_id, "Message enqueued");
        Ok(message)
    }

    /// Claim the oldest visible message, if any
    pub async fn receive(&self) -> Result<Option<Delivery>> {
        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;
        let hide_ms = duration_ms(self.visibility_timeout);

        let claimed = retry_on_lock("work_queue_receive", max_wait_ms, || async {
            let receipt = Uuid::new_v4().to_string();
            let now = now_ms();

            // Single statement: the sub-select and the claim run under one write lock
            let row = sqlx::query(
                r#"
                UPDATE work_queue
                SET receive_count = receive_count + 1,
                    receipt = ?,
                    visible_at = ?
                WHERE message_id = (
                    SELECT message_id FROM work_queue
                    WHERE state = 'pending' AND visible_at <= ?
                    ORDER BY visible_at, enqueued_at, message_id
                    LIMIT 1
                )
                  AND state = 'pending'
                  AND visible_at <= ?
                RETURNING message_id, item_id, content_hash, enqueued_at, receive_count
                "#,
            )
            .bind(&receipt)
            .bind(now.saturating_add(hide_ms))
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await?;

            Ok(row.map(|row| (row, receipt)))
        })
        .await?;

        let Some((row, receipt)) = claimed else {
            return Ok(None);
        };

        let delivery = Delivery {
            message: message_from_row(&row)?,
            receive_count: receive_count_from_row(&row),
            receipt,
        };

        tracing::debug!(
            message_id = %delivery.message.message_id,
            item_id = %delivery.message.item_id,
            receive_count = delivery.receive_count,
            "Message received"
        );

        Ok(Some(delivery))
    }

    /// Remove a settled message; returns false for a stale receipt
    pub async fn ack(&self, receipt: &str) -> Result<bool> {
        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;
        let acked = retry_on_lock("work_queue_ack", max_wait_ms, || async {
            let result = sqlx::query("DELETE FROM work_queue WHERE receipt = ? AND state = 'pending'")
                .bind(receipt)
                .execute(pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if !acked {
            tracing::debug!(receipt, "Ack ignored: receipt no longer current");
        }
        Ok(acked)
    }

    /// Make the message visible again after `delay`
    pub async fn retry(&self, receipt: &str, delay: Duration, reason: &str) -> Result<bool> {
        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;
        let retried = retry_on_lock("work_queue_retry", max_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE work_queue
                SET visible_at = ?, receipt = NULL, last_error = ?
                WHERE receipt = ? AND state = 'pending'
                "#,
            )
            .bind(now_ms().saturating_add(duration_ms(delay)))
            .bind(reason)
            .bind(receipt)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if !retried {
            tracing::debug!(receipt, "Retry ignored: receipt no longer current");
        }
        Ok(retried)
    }

    /// Move the message out of the live queue
    pub async fn dead_letter(&self, receipt: &str, reason: &str) -> Result<bool> {
        let max_wait_ms = max_lock_wait_ms(&self.pool).await?;
        let pool = &self.pool;
        let moved = retry_on_lock("work_queue_dead_letter", max_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE work_queue
                SET state = 'dead', receipt = NULL, last_error = ?, dead_lettered_at = ?
                WHERE receipt = ? AND state = 'pending'
                "#,
            )
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .bind(receipt)
            .execute(pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if !moved {
            tracing::debug!(receipt, "Dead-letter ignored: receipt no longer current");
        }
        Ok(moved)
    }

    /// Redelivery delay after the given delivery attempt
    ///
    /// `retry_base_delay * 2^(receive_count - 1)`, capped at the visibility timeout.
    pub fn retry_delay(&self, receive_count: u32) -> Duration {
        let factor = 1u32
            .checked_shl(receive_count.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.visibility_timeout)
            .min(self.visibility_timeout)
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, item_id, content_hash, enqueued_at, receive_count,
                   last_error, dead_lettered_at
            FROM work_queue
            WHERE state = 'dead'
            ORDER BY dead_lettered_at, message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    message: message_from_row(row)?,
                    receive_count: receive_count_from_row(row),
                    last_error: row.get("last_error"),
                    dead_lettered_at: row.get("dead_lettered_at"),
                })
            })
            .collect()
    }

    /// Return a dead-lettered message to the live queue with a fresh receive budget
    pub async fn requeue_dead_letter(&self, message_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET state = 'pending', visible_at = ?, receive_count = 0, receipt = NULL,
                dead_lettered_at = NULL
            WHERE message_id = ? AND state = 'dead'
            "#,
        )
        .bind(now_ms())
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("dead-lettered message {}", message_id)));
        }

        tracing::info!(message_id, "Dead-lettered message requeued");
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' AND visible_at <= ? THEN 1 ELSE 0 END), 0) AS visible,
                COALESCE(SUM(CASE WHEN state = 'pending' AND visible_at > ? THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END), 0) AS dead
            FROM work_queue
            "#,
        )
        .bind(now_ms())
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            visible: row.get("visible"),
            in_flight: row.get("in_flight"),
            dead: row.get("dead"),
        })
    }
}
