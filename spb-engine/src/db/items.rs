//! Agenda item persistence
//!
//! `content_hash` is the version guard: ingestion rewrites source fields only
//! when it changes, and enrichment is applied only against the hash it was
//! computed from.

use chrono::Utc;
use spb_common::models::{AgendaItem, ImpactLevel, ItemEnrichment};
use spb_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use super::{decode_topics, encode_topics};
use crate::utils::{max_lock_wait_ms, retry_on_lock};

const ITEM_COLUMNS: &str = "item_id, meeting_id, ordinal, title, description, content_hash, topic, \
     impact_level, relevance, ai_analysis, topics, analysis_version, last_analyzed_hash";

/// Result of a hash-guarded enrichment write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalUpdate {
    /// Enrichment written; carries the new `analysis_version`
    Applied { analysis_version: i64 },
    /// Enrichment for this content hash was already written by another delivery
    AlreadyApplied,
}

fn item_from_row(row: &SqliteRow) -> Result<AgendaItem> {
    let impact_level: Option<String> = row.get("impact_level");
    let topics: String = row.get("topics");

    Ok(AgendaItem {
        item_id: row.get("item_id"),
        meeting_id: row.get("meeting_id"),
        ordinal: row.get("ordinal"),
        title: row.get("title"),
        description: row.get("description"),
        content_hash: row.get("content_hash"),
        topic: row.get("topic"),
        impact_level: impact_level
            .as_deref()
            .map(str::parse::<ImpactLevel>)
            .transpose()?,
        relevance: row.get("relevance"),
        ai_analysis: row.get("ai_analysis"),
        topics: decode_topics(&topics)?,
        analysis_version: row.get("analysis_version"),
        last_analyzed_hash: row.get("last_analyzed_hash"),
    })
}

/// Load an agenda item by id
pub async fn get_item(pool: &SqlitePool, item_id: &str) -> Result<Option<AgendaItem>> {
    let sql = format!("SELECT {} FROM agenda_items WHERE item_id = ?", ITEM_COLUMNS);
    let row = sqlx::query(&sql).bind(item_id).fetch_optional(pool).await?;
    row.as_ref().map(item_from_row).transpose()
}

/// Stored content hash only (cheap dedup lookup)
pub async fn get_content_hash(pool: &SqlitePool, item_id: &str) -> Result<Option<String>> {
    let hash: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM agenda_items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(pool)
            .await?;
    Ok(hash)
}

/// Create or update an item's source fields by derived id
///
/// Enrichment columns are preserved. The update only fires when the content
/// hash differs; returns true when a row was inserted or changed.
pub async fn upsert_item<'e, E>(executor: E, item: &AgendaItem) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO agenda_items (item_id, meeting_id, ordinal, title, description, content_hash)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            meeting_id = excluded.meeting_id,
            ordinal = excluded.ordinal,
            title = excluded.title,
            description = excluded.description,
            content_hash = excluded.content_hash,
            updated_at = CURRENT_TIMESTAMP
        WHERE agenda_items.content_hash != excluded.content_hash
        "#,
    )
    .bind(&item.item_id)
    .bind(&item.meeting_id)
    .bind(item.ordinal)
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.content_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Write enrichment fields iff the stored content hash equals `expected_hash`
///
/// Increments `analysis_version` and records `last_analyzed_hash`.
/// Errors with [`Error::StaleWrite`] when the item has moved on to newer
/// content, and [`Error::NotFound`] when it does not exist.
pub async fn conditional_update_item(
    pool: &SqlitePool,
    item_id: &str,
    expected_hash: &str,
    enrichment: &ItemEnrichment,
) -> Result<ConditionalUpdate> {
    let topics = encode_topics(&enrichment.topics)?;
    let analyzed_at = Utc::now().to_rfc3339();
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    let updated: Option<i64> = retry_on_lock("conditional_update_item", max_wait_ms, || async {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE agenda_items SET
                topic = ?,
                impact_level = ?,
                relevance = ?,
                ai_analysis = ?,
                topics = ?,
                analysis_version = analysis_version + 1,
                last_analyzed_hash = content_hash,
                analyzed_at = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE item_id = ?
              AND content_hash = ?
              AND (last_analyzed_hash IS NULL OR last_analyzed_hash != content_hash)
            RETURNING analysis_version
            "#,
        )
        .bind(&enrichment.primary_topic)
        .bind(enrichment.impact_level.as_str())
        .bind(enrichment.relevance)
        .bind(&enrichment.summary)
        .bind(&topics)
        .bind(&analyzed_at)
        .bind(item_id)
        .bind(expected_hash)
        .fetch_optional(pool)
        .await?;
        Ok(version)
    })
    .await?;

    if let Some(analysis_version) = updated {
        return Ok(ConditionalUpdate::Applied { analysis_version });
    }

    // Distinguish why the guard failed
    match get_content_hash(pool, item_id).await? {
        None => Err(Error::NotFound(format!("agenda item {}", item_id))),
        Some(current_hash) if current_hash != expected_hash => Err(Error::StaleWrite {
            item_id: item_id.to_string(),
            expected_hash: expected_hash.to_string(),
            current_hash,
        }),
        Some(_) => Ok(ConditionalUpdate::AlreadyApplied),
    }
}

/// Items of one meeting in agenda order
pub async fn query_by_meeting(pool: &SqlitePool, meeting_id: &str) -> Result<Vec<AgendaItem>> {
    let sql = format!(
        "SELECT {} FROM agenda_items WHERE meeting_id = ? ORDER BY ordinal, item_id",
        ITEM_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(meeting_id).fetch_all(pool).await?;
    rows.iter().map(item_from_row).collect()
}

/// All items (index building)
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<AgendaItem>> {
    let sql = format!("SELECT {} FROM agenda_items ORDER BY item_id", ITEM_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(item_from_row).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agenda_items")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Items whose enrichment matches their current content
pub async fn count_enriched(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM agenda_items WHERE last_analyzed_hash = content_hash",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}
