//! Meeting persistence
//!
//! Source fields are owned by the Ingestor; `ai_summary`/`topics` are owned
//! by the Analyzer rollup. Upserts never touch the other side's columns.

use chrono::NaiveDate;
use spb_common::models::{Meeting, MeetingStatus};
use spb_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use super::{decode_topics, format_date, parse_date};
use crate::utils::{max_lock_wait_ms, retry_on_lock};

const MEETING_COLUMNS: &str = "meeting_id, body_name, meeting_date, meeting_time, location, status, \
     agenda_url, source_event_id, content_hash, ai_summary, topics";

fn meeting_from_row(row: &SqliteRow) -> Result<Meeting> {
    let meeting_date: String = row.get("meeting_date");
    let status: String = row.get("status");
    let topics: String = row.get("topics");

    Ok(Meeting {
        meeting_id: row.get("meeting_id"),
        body_name: row.get("body_name"),
        meeting_date: parse_date(&meeting_date)?,
        meeting_time: row.get("meeting_time"),
        location: row.get("location"),
        status: status.parse::<MeetingStatus>()?,
        agenda_url: row.get("agenda_url"),
        source_event_id: row.get("source_event_id"),
        content_hash: row.get("content_hash"),
        ai_summary: row.get("ai_summary"),
        topics: decode_topics(&topics)?,
    })
}

/// Load a meeting by id
pub async fn get_meeting(pool: &SqlitePool, meeting_id: &str) -> Result<Option<Meeting>> {
    let sql = format!("SELECT {} FROM meetings WHERE meeting_id = ?", MEETING_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(meeting_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(meeting_from_row).transpose()
}

/// Create or update a meeting's source fields by derived id
///
/// The update only fires when the content hash differs (or the stored row is
/// a placeholder), so replays are no-ops. Returns true when a row changed.
pub async fn upsert_meeting<'e, E>(executor: E, meeting: &Meeting) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO meetings (
            meeting_id, body_name, meeting_date, meeting_time, location,
            status, agenda_url, source_event_id, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(meeting_id) DO UPDATE SET
            body_name = excluded.body_name,
            meeting_date = excluded.meeting_date,
            meeting_time = excluded.meeting_time,
            location = excluded.location,
            status = excluded.status,
            agenda_url = excluded.agenda_url,
            source_event_id = excluded.source_event_id,
            content_hash = excluded.content_hash,
            updated_at = CURRENT_TIMESTAMP
        WHERE meetings.content_hash IS NULL
           OR meetings.content_hash != excluded.content_hash
        "#,
    )
    .bind(&meeting.meeting_id)
    .bind(&meeting.body_name)
    .bind(format_date(meeting.meeting_date))
    .bind(&meeting.meeting_time)
    .bind(&meeting.location)
    .bind(meeting.status.as_str())
    .bind(&meeting.agenda_url)
    .bind(meeting.source_event_id)
    .bind(&meeting.content_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a placeholder meeting unless one with this id already exists
///
/// Returns true when the placeholder was inserted.
pub async fn ensure_meeting<'e, E>(
    executor: E,
    meeting_id: &str,
    body_name: &str,
    meeting_date: NaiveDate,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO meetings (meeting_id, body_name, meeting_date, status, content_hash)
        VALUES (?, ?, ?, 'scheduled', NULL)
        ON CONFLICT(meeting_id) DO NOTHING
        "#,
    )
    .bind(meeting_id)
    .bind(body_name)
    .bind(format_date(meeting_date))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Meetings within `[start, end]`, optionally for one body, newest first
pub async fn query_by_date_range(
    pool: &SqlitePool,
    body_name: Option<&str>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Meeting>> {
    let rows = match body_name {
        Some(body) => {
            let sql = format!(
                "SELECT {} FROM meetings WHERE body_name = ? AND meeting_date BETWEEN ? AND ? \
                 ORDER BY meeting_date DESC, meeting_id",
                MEETING_COLUMNS
            );
            sqlx::query(&sql)
                .bind(body)
                .bind(format_date(start))
                .bind(format_date(end))
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM meetings WHERE meeting_date BETWEEN ? AND ? \
                 ORDER BY meeting_date DESC, meeting_id",
                MEETING_COLUMNS
            );
            sqlx::query(&sql)
                .bind(format_date(start))
                .bind(format_date(end))
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter().map(meeting_from_row).collect()
}

/// All meetings (index building, stats)
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Meeting>> {
    let sql = format!(
        "SELECT {} FROM meetings ORDER BY meeting_date DESC, meeting_id",
        MEETING_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(meeting_from_row).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meetings")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Recompute a meeting's enrichment rollup from its items
///
/// `topics` becomes the union of item topics; `ai_summary` the analysis of
/// the most relevant enriched item. Read and write happen in one statement
/// under the write lock, so the last rollup to commit always reflects every
/// item write committed before it.
pub async fn refresh_rollup(pool: &SqlitePool, meeting_id: &str) -> Result<()> {
    let max_wait_ms = max_lock_wait_ms(pool).await?;

    retry_on_lock("refresh_rollup", max_wait_ms, || async {
        sqlx::query(
            r#"
            UPDATE meetings SET
                topics = (
                    SELECT json_group_array(value) FROM (
                        SELECT DISTINCT j.value AS value
                        FROM agenda_items a, json_each(a.topics) j
                        WHERE a.meeting_id = ? AND a.analysis_version > 0
                        ORDER BY j.value
                    )
                ),
                ai_summary = (
                    SELECT ai_analysis
                    FROM agenda_items
                    WHERE meeting_id = ? AND analysis_version > 0
                    ORDER BY relevance DESC, ordinal ASC
                    LIMIT 1
                ),
                updated_at = CURRENT_TIMESTAMP
            WHERE meeting_id = ?
            "#,
        )
        .bind(meeting_id)
        .bind(meeting_id)
        .bind(meeting_id)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::items::{conditional_update_item, upsert_item};
    use spb_common::db::init_database;
    use spb_common::models::{AgendaItem, ImpactLevel, ItemEnrichment};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sample_meeting(id: &str, body: &str, day: &str, hash: &str) -> Meeting {
        Meeting {
            meeting_id: id.to_string(),
            body_name: body.to_string(),
            meeting_date: date(day),
            meeting_time: Some("6:00 PM".to_string()),
            location: Some("Council Chambers".to_string()),
            status: MeetingStatus::Scheduled,
            agenda_url: Some("https://example.org/agenda.pdf".to_string()),
            source_event_id: Some(42),
            content_hash: Some(hash.to_string()),
            ai_summary: None,
            topics: BTreeSet::new(),
        }
    }

    async fn test_pool() -> (TempDir, SqlitePool) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("spb.db")).await.unwrap();
        (temp_dir, pool)
    }

    #[tokio::test]
    async fn test_upsert_is_noop_for_same_hash() {
        let (_dir, pool) = test_pool().await;
        let meeting = sample_meeting("mtg_a", "City Council", "2024-03-01", "h1");

        assert!(upsert_meeting(&pool, &meeting).await.unwrap());
        assert!(!upsert_meeting(&pool, &meeting).await.unwrap());

        let mut changed = meeting.clone();
        changed.status = MeetingStatus::Final;
        changed.content_hash = Some("h2".to_string());
        assert!(upsert_meeting(&pool, &changed).await.unwrap());

        let loaded = get_meeting(&pool, "mtg_a").await.unwrap().unwrap();
        assert_eq!(loaded.status, MeetingStatus::Final);
        assert_eq!(count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_replaced_by_real_meeting() {
        let (_dir, pool) = test_pool().await;

        assert!(ensure_meeting(&pool, "mtg_a", "City Council", date("2024-03-01"))
            .await
            .unwrap());
        assert!(!ensure_meeting(&pool, "mtg_a", "City Council", date("2024-03-01"))
            .await
            .unwrap());
        assert!(get_meeting(&pool, "mtg_a").await.unwrap().unwrap().is_placeholder());

        let meeting = sample_meeting("mtg_a", "City Council", "2024-03-01", "h1");
        assert!(upsert_meeting(&pool, &meeting).await.unwrap());
        let loaded = get_meeting(&pool, "mtg_a").await.unwrap().unwrap();
        assert!(!loaded.is_placeholder());
        assert_eq!(loaded.location.as_deref(), Some("Council Chambers"));
    }

    #[tokio::test]
    async fn test_query_by_date_range_filters_body() {
        let (_dir, pool) = test_pool().await;
        for (id, body, day) in [
            ("mtg_1", "City Council", "2024-03-01"),
            ("mtg_2", "City Council", "2024-03-15"),
            ("mtg_3", "Plan Commission", "2024-03-10"),
            ("mtg_4", "City Council", "2024-04-20"),
        ] {
            upsert_meeting(&pool, &sample_meeting(id, body, day, "h")).await.unwrap();
        }

        let council = query_by_date_range(&pool, Some("City Council"), date("2024-03-01"), date("2024-03-31"))
            .await
            .unwrap();
        let ids: Vec<_> = council.iter().map(|m| m.meeting_id.as_str()).collect();
        assert_eq!(ids, vec!["mtg_2", "mtg_1"]);

        let all_march = query_by_date_range(&pool, None, date("2024-03-01"), date("2024-03-31"))
            .await
            .unwrap();
        assert_eq!(all_march.len(), 3);
    }

    #[tokio::test]
    async fn test_rollup_of_unenriched_meeting_is_empty() {
        let (_dir, pool) = test_pool().await;
        upsert_meeting(&pool, &sample_meeting("mtg_a", "City Council", "2024-03-01", "h1"))
            .await
            .unwrap();
        upsert_item(
            &pool,
            &AgendaItem::new("itm_1".into(), "mtg_a".into(), 1, "Budget".into(), None, "c1".into()),
        )
        .await
        .unwrap();

        refresh_rollup(&pool, "mtg_a").await.unwrap();

        let loaded = get_meeting(&pool, "mtg_a").await.unwrap().unwrap();
        assert!(loaded.topics.is_empty());
        assert!(loaded.ai_summary.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rollups_end_with_latest_items() {
        const ITEMS: usize = 8;
        let (_dir, pool) = test_pool().await;
        upsert_meeting(&pool, &sample_meeting("mtg_a", "City Council", "2024-03-01", "h1"))
            .await
            .unwrap();

        for round in 0..10 {
            let mut tasks = Vec::new();
            for i in 0..ITEMS {
                let item_id = format!("itm_{}", i);
                let hash = format!("c{}_{}", round, i);
                upsert_item(
                    &pool,
                    &AgendaItem::new(
                        item_id.clone(),
                        "mtg_a".into(),
                        i as i64 + 1,
                        format!("Item {}", i),
                        None,
                        hash.clone(),
                    ),
                )
                .await
                .unwrap();

                let pool = pool.clone();
                tasks.push(tokio::spawn(async move {
                    let topic = format!("r{}-t{}", round, i);
                    let enrichment = ItemEnrichment {
                        summary: format!("round {} item {}", round, i),
                        impact_level: ImpactLevel::Low,
                        relevance: i as f64,
                        primary_topic: topic.clone(),
                        topics: BTreeSet::from([topic]),
                    };
                    conditional_update_item(&pool, &item_id, &hash, &enrichment)
                        .await
                        .unwrap();
                    refresh_rollup(&pool, "mtg_a").await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            let loaded = get_meeting(&pool, "mtg_a").await.unwrap().unwrap();
            let expected: BTreeSet<String> = (0..ITEMS).map(|i| format!("r{}-t{}", round, i)).collect();
            assert_eq!(loaded.topics, expected, "round {}", round);
            assert_eq!(
                loaded.ai_summary.as_deref(),
                Some(format!("round {} item {}", round, ITEMS - 1).as_str())
            );
        }
    }
}
