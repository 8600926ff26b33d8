//! Ingest cursor persistence
//!
//! One opaque resumption token per source. Absence means "start from the
//! beginning of the lookback window".

use spb_common::Result;
use sqlx::SqlitePool;

pub async fn load_cursor(pool: &SqlitePool, source: &str) -> Result<Option<String>> {
    let token: Option<String> = sqlx::query_scalar("SELECT token FROM ingest_cursors WHERE source = ?")
        .bind(source)
        .fetch_optional(pool)
        .await?;
    Ok(token)
}

/// Persist (or clear, with `None`) the cursor for `source`
pub async fn save_cursor(pool: &SqlitePool, source: &str, token: Option<&str>) -> Result<()> {
    match token {
        Some(token) => {
            sqlx::query(
                r#"
                INSERT INTO ingest_cursors (source, token) VALUES (?, ?)
                ON CONFLICT(source) DO UPDATE SET token = excluded.token, updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(source)
            .bind(token)
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM ingest_cursors WHERE source = ?")
                .bind(source)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}
