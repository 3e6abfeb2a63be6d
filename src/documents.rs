//! Document rows: content, version and index bookkeeping.
//!
//! Document storage and versioning belong to the authoring side of the
//! system; this module only holds what the indexing pipeline reads (the
//! body of the current version) and what it writes back (the up-to-date
//! marker and the error state).

use anyhow::Result;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool};

use crate::db::now_ms;
use crate::models::Document;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_READY: &str = "ready";
pub const STATUS_ERROR: &str = "error";

/// Insert or replace the content of a document under a new version id.
///
/// The index pointers (`current_revision_id`, `indexed_version_id`) are left
/// untouched; they only move when a revision is switched in.
pub async fn put_document(
    pool: &SqlitePool,
    workspace_id: &str,
    base_id: &str,
    document_id: &str,
    version_id: &str,
    body: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, workspace_id, base_id, body, version_id, index_status, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(workspace_id, id) DO UPDATE SET
            body = excluded.body,
            version_id = excluded.version_id,
            index_status = excluded.index_status,
            index_error = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(document_id)
    .bind(workspace_id)
    .bind(base_id)
    .bind(body)
    .bind(version_id)
    .bind(STATUS_PENDING)
    .bind(now_ms())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_document(
    pool: &SqlitePool,
    workspace_id: &str,
    document_id: &str,
) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ? AND workspace_id = ?")
        .bind(document_id)
        .bind(workspace_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(document_from_row))
}

pub async fn list_documents(
    pool: &SqlitePool,
    workspace_id: &str,
    base_id: &str,
) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE workspace_id = ? AND base_id = ? ORDER BY id")
        .bind(workspace_id)
        .bind(base_id)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(document_from_row).collect())
}

/// All documents that have a current revision.
pub async fn list_indexed(pool: &SqlitePool) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        "SELECT * FROM documents WHERE current_revision_id IS NOT NULL ORDER BY workspace_id, id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(document_from_row).collect())
}

/// Record that `version_id` is now fully indexed.
pub async fn mark_up_to_date<'e, E>(
    executor: E,
    workspace_id: &str,
    document_id: &str,
    version_id: &str,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE documents
        SET indexed_version_id = ?, index_status = ?, index_error = NULL, updated_at = ?
        WHERE workspace_id = ? AND id = ?
        "#,
    )
    .bind(version_id)
    .bind(STATUS_READY)
    .bind(now_ms())
    .bind(workspace_id)
    .bind(document_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_error(
    pool: &SqlitePool,
    workspace_id: &str,
    document_id: &str,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents SET index_status = ?, index_error = ?, updated_at = ?
        WHERE workspace_id = ? AND id = ?
        "#,
    )
    .bind(STATUS_ERROR)
    .bind(error)
    .bind(now_ms())
    .bind(workspace_id)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        base_id: row.get("base_id"),
        body: row.get("body"),
        version_id: row.get("version_id"),
        current_revision_id: row.get("current_revision_id"),
        current_chunk_set_id: row.get("current_chunk_set_id"),
        indexed_version_id: row.get("indexed_version_id"),
        index_status: row.get("index_status"),
        index_error: row.get("index_error"),
        updated_at: row.get("updated_at"),
    }
}
