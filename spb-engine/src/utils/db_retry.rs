//! Database Retry Logic
//!
//! Exponential backoff for transient SQLite lock errors. Overlapping ingest
//! runs and a pool of analyzer workers all write the same file, so short
//! "database is locked" windows are expected and not failures.

use spb_common::db::{get_setting_i64, MAX_LOCK_WAIT_SETTING};
use spb_common::Result;
use sqlx::SqlitePool;
use std::time::{Duration, Instant};

const DEFAULT_MAX_LOCK_WAIT_MS: i64 = 5000;

/// Configured upper bound for lock retries (settings table, default 5000ms)
pub async fn max_lock_wait_ms(pool: &SqlitePool) -> Result<u64> {
    let value = get_setting_i64(pool, MAX_LOCK_WAIT_SETTING, DEFAULT_MAX_LOCK_WAIT_MS).await?;
    Ok(value.max(0) as u64)
}

/// Retry a database operation with exponential backoff until max_wait_ms elapses.
///
/// Only lock contention is retried; any other error is returned immediately.
/// Backoff starts at 10ms, doubles, and is capped at 1000ms.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after significant retry period (>2s)"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_lock_contention() {
                    return Err(err);
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
        }
    }
}
