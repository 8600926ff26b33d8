//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up to date.
//! Every statement is idempotent, so concurrent engine processes (overlapping
//! ingest runs, analyzer pools) may all call [`init_database`] at startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Settings key bounding how long lock-contended writes are retried
pub const MAX_LOCK_WAIT_SETTING: &str = "db_max_lock_wait_ms";

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Per-connection pragmas: every pooled connection needs them
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 250").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets search snapshots read while ingest/analysis write
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_meetings_table(pool).await?;
    create_agenda_items_table(pool).await?;
    create_documents_table(pool).await?;
    create_work_queue_table(pool).await?;
    create_ingest_cursors_table(pool).await?;
    init_default_settings(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime tuning key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the meetings table
///
/// `content_hash` is NULL for placeholder rows inserted ahead of the
/// source meeting record.
pub async fn create_meetings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meetings (
            meeting_id TEXT PRIMARY KEY,
            body_name TEXT NOT NULL,
            meeting_date TEXT NOT NULL,
            meeting_time TEXT,
            location TEXT,
            status TEXT NOT NULL DEFAULT 'scheduled'
                CHECK (status IN ('scheduled', 'final')),
            agenda_url TEXT,
            source_event_id INTEGER,
            content_hash TEXT,
            ai_summary TEXT,
            topics TEXT NOT NULL DEFAULT '[]',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_meetings_body_date ON meetings(body_name, meeting_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_meetings_date ON meetings(meeting_date)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the agenda_items table
pub async fn create_agenda_items_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agenda_items (
            item_id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES meetings(meeting_id),
            ordinal INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            content_hash TEXT NOT NULL,
            topic TEXT,
            impact_level TEXT CHECK (impact_level IN ('high', 'medium', 'low')),
            relevance REAL,
            ai_analysis TEXT,
            topics TEXT NOT NULL DEFAULT '[]',
            analysis_version INTEGER NOT NULL DEFAULT 0 CHECK (analysis_version >= 0),
            last_analyzed_hash TEXT,
            analyzed_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_agenda_items_meeting ON agenda_items(meeting_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the documents table
pub async fn create_documents_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            document_id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES meetings(meeting_id),
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            doc_type TEXT NOT NULL CHECK (doc_type IN ('agenda', 'minutes')),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_meeting ON documents(meeting_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the work_queue table
///
/// `visible_at` is unix milliseconds; a message is deliverable when
/// `state = 'pending' AND visible_at <= now`.
pub async fn create_work_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_queue (
            message_id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            visible_at INTEGER NOT NULL,
            receive_count INTEGER NOT NULL DEFAULT 0,
            receipt TEXT,
            state TEXT NOT NULL DEFAULT 'pending' CHECK (state IN ('pending', 'dead')),
            last_error TEXT,
            dead_lettered_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_queue_visible ON work_queue(state, visible_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the ingest_cursors table (one resumption token per source)
pub async fn create_ingest_cursors_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_cursors (
            source TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Ensure default settings exist (NULL values are reset)
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    ensure_setting(pool, MAX_LOCK_WAIT_SETTING, "5000").await?;
    Ok(())
}

async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read an integer setting, falling back to `default` when absent or unparsable
pub async fn get_setting_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value
        .flatten()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default))
}
