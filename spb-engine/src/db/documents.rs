//! Document reference persistence (agenda packets, minutes)

use spb_common::models::{Document, DocumentType};
use spb_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let doc_type: String = row.get("doc_type");
    Ok(Document {
        document_id: row.get("document_id"),
        meeting_id: row.get("meeting_id"),
        title: row.get("title"),
        url: row.get("url"),
        doc_type: doc_type.parse::<DocumentType>()?,
    })
}

/// Create or refresh a document reference; returns true when a row changed
pub async fn upsert_document<'e, E>(executor: E, document: &Document) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO documents (document_id, meeting_id, title, url, doc_type)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            title = excluded.title
        WHERE documents.title != excluded.title
        "#,
    )
    .bind(&document.document_id)
    .bind(&document.meeting_id)
    .bind(&document.title)
    .bind(&document.url)
    .bind(document.doc_type.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn query_by_meeting(pool: &SqlitePool, meeting_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        "SELECT document_id, meeting_id, title, url, doc_type FROM documents \
         WHERE meeting_id = ? ORDER BY doc_type, document_id",
    )
    .bind(meeting_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(document_from_row).collect()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        "SELECT document_id, meeting_id, title, url, doc_type FROM documents ORDER BY document_id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(document_from_row).collect()
}
