//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log connection acquisition and hold time,
//! to diagnose pool saturation when many analyzer workers write concurrently.

use spb_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::time::Instant;

/// Monitored transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl<'c> MonitoredTransaction<'c> {
    fn new(tx: Transaction<'c, Sqlite>, caller: &'static str, acquired_at: Instant) -> Self {
        Self {
            tx: Some(tx),
            caller,
            acquired_at,
        }
    }

    /// Connection to run statements on inside the transaction
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_mut()
            .map(|tx| &mut **tx)
            .ok_or_else(|| Error::Internal(format!("{}: transaction already consumed", self.caller)))
    }

    /// Commit the transaction and log release timing
    pub async fn commit(mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal(format!("{}: transaction already consumed", self.caller)))?;

        tx.commit().await?;

        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                "LONG TRANSACTION - Connection held for extended period, may contribute to pool saturation"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, "Connection released (commit)");
        }

        Ok(())
    }
}

impl<'c> Drop for MonitoredTransaction<'c> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // Dropped without commit: sqlx rolls back; usually an error path
            tracing::debug!(
                caller = self.caller,
                held_ms = self.acquired_at.elapsed().as_millis(),
                "Connection released (drop)"
            );
        }
    }
}

/// Begin a monitored transaction with connection pool timing logs
pub async fn begin_monitored<'c>(
    pool: &'c sqlx::SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>> {
    let start = Instant::now();

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - Pool may be saturated (all connections in use)"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction::new(tx, caller, Instant::now()))
}
