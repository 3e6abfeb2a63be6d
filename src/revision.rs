//! Revision manager.
//!
//! A revision is one generation of a document's indexed output. It is
//! created in `processing` before any vector is written, switched in as the
//! document's current revision only after its whole chunk set is upserted,
//! and then marked `ready`. A crash anywhere before the switch leaves the
//! previous revision current.
//!
//! The switch is a single `UPDATE ... RETURNING` on the document row, so the
//! current pointer moves in one step and a reader never sees a document
//! that had a current revision without one. The pipeline runs it in the
//! same transaction that marks the revision `ready`, so a current revision
//! is never left in `processing`.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::now_ms;
use crate::models::{DocumentIndexRevision, RevisionStatus};

/// Partial update of a revision row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RevisionPatch {
    pub status: Option<RevisionStatus>,
    pub chunk_set_id: Option<String>,
    pub chunk_count: Option<i64>,
    pub total_tokens: Option<i64>,
    pub total_chars: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchResult {
    pub previous_revision_id: Option<String>,
}

pub async fn create_revision(
    pool: &SqlitePool,
    workspace_id: &str,
    document_id: &str,
    version_id: &str,
    policy_hash: &str,
) -> Result<DocumentIndexRevision> {
    let revision = DocumentIndexRevision {
        id: Uuid::new_v4().to_string(),
        workspace_id: workspace_id.to_string(),
        document_id: document_id.to_string(),
        version_id: version_id.to_string(),
        policy_hash: policy_hash.to_string(),
        status: RevisionStatus::Processing,
        chunk_set_id: None,
        chunk_count: 0,
        total_tokens: 0,
        total_chars: 0,
        started_at: now_ms(),
        finished_at: None,
        error: None,
    };

    sqlx::query(
        r#"
        INSERT INTO document_index_revisions
            (id, workspace_id, document_id, version_id, policy_hash, status, started_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&revision.id)
    .bind(&revision.workspace_id)
    .bind(&revision.document_id)
    .bind(&revision.version_id)
    .bind(&revision.policy_hash)
    .bind(revision.status.as_str())
    .bind(revision.started_at)
    .execute(pool)
    .await
    .context("Failed to create revision")?;

    Ok(revision)
}

pub async fn update_revision<'e, E>(executor: E, id: &str, patch: RevisionPatch) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE document_index_revisions SET
            status = COALESCE(?, status),
            chunk_set_id = COALESCE(?, chunk_set_id),
            chunk_count = COALESCE(?, chunk_count),
            total_tokens = COALESCE(?, total_tokens),
            total_chars = COALESCE(?, total_chars),
            finished_at = COALESCE(?, finished_at),
            error = COALESCE(?, error)
        WHERE id = ?
        "#,
    )
    .bind(patch.status.map(|s| s.as_str()))
    .bind(patch.chunk_set_id)
    .bind(patch.chunk_count)
    .bind(patch.total_tokens)
    .bind(patch.total_chars)
    .bind(patch.finished_at)
    .bind(patch.error)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Move the document's current-revision pointer to `new_revision_id` and
/// return the revision it replaced.
pub async fn switch_current_revision<'e, E>(
    executor: E,
    workspace_id: &str,
    document_id: &str,
    new_revision_id: &str,
    chunk_set_id: &str,
) -> Result<SwitchResult>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        UPDATE documents SET
            previous_revision_id = current_revision_id,
            current_revision_id = ?,
            current_chunk_set_id = ?,
            updated_at = ?
        WHERE workspace_id = ? AND id = ?
        RETURNING previous_revision_id
        "#,
    )
    .bind(new_revision_id)
    .bind(chunk_set_id)
    .bind(now_ms())
    .bind(workspace_id)
    .bind(document_id)
    .fetch_optional(executor)
    .await?
    .with_context(|| format!("document {}/{} not found", workspace_id, document_id))?;

    Ok(SwitchResult {
        previous_revision_id: row.get("previous_revision_id"),
    })
}

pub async fn mark_ready<'e, E>(executor: E, id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    update_revision(
        executor,
        id,
        RevisionPatch {
            status: Some(RevisionStatus::Ready),
            finished_at: Some(now_ms()),
            ..Default::default()
        },
    )
    .await
}

/// Fail a revision that is still `processing`. A revision some document
/// points at is left alone.
pub async fn mark_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE document_index_revisions
        SET status = ?, finished_at = ?, error = ?
        WHERE id = ? AND status = ?
          AND id NOT IN (SELECT current_revision_id FROM documents WHERE current_revision_id IS NOT NULL)
        "#,
    )
    .bind(RevisionStatus::Failed.as_str())
    .bind(now_ms())
    .bind(error)
    .bind(id)
    .bind(RevisionStatus::Processing.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_revision(pool: &SqlitePool, id: &str) -> Result<Option<DocumentIndexRevision>> {
    let row = sqlx::query("SELECT * FROM document_index_revisions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(revision_from_row).transpose()
}

/// The revision the document currently points at, if any.
pub async fn get_current_revision(
    pool: &SqlitePool,
    workspace_id: &str,
    document_id: &str,
) -> Result<Option<DocumentIndexRevision>> {
    let row = sqlx::query(
        r#"
        SELECT r.* FROM documents d
        JOIN document_index_revisions r ON r.id = d.current_revision_id
        WHERE d.id = ? AND d.workspace_id = ?
        "#,
    )
    .bind(document_id)
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(revision_from_row).transpose()
}

pub async fn list_revisions(
    pool: &SqlitePool,
    workspace_id: &str,
    document_id: &str,
) -> Result<Vec<DocumentIndexRevision>> {
    let rows = sqlx::query(
        "SELECT * FROM document_index_revisions WHERE workspace_id = ? AND document_id = ? ORDER BY started_at",
    )
    .bind(workspace_id)
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(revision_from_row).collect()
}

/// Fail `processing` revisions started before `older_than` (epoch millis)
/// whose job died without reaching the failure path. Current revisions are
/// skipped.
pub async fn fail_abandoned(pool: &SqlitePool, older_than: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE document_index_revisions
        SET status = ?, finished_at = ?, error = 'abandoned: indexing run did not finish'
        WHERE status = ? AND started_at < ?
          AND id NOT IN (SELECT current_revision_id FROM documents WHERE current_revision_id IS NOT NULL)
        "#,
    )
    .bind(RevisionStatus::Failed.as_str())
    .bind(now_ms())
    .bind(RevisionStatus::Processing.as_str())
    .bind(older_than)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

fn revision_from_row(row: &SqliteRow) -> Result<DocumentIndexRevision> {
    let status: String = row.get("status");
    Ok(DocumentIndexRevision {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        document_id: row.get("document_id"),
        version_id: row.get("version_id"),
        policy_hash: row.get("policy_hash"),
        status: status.parse()?,
        chunk_set_id: row.get("chunk_set_id"),
        chunk_count: row.get("chunk_count"),
        total_tokens: row.get("total_tokens"),
        total_chars: row.get("total_chars"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error: row.get("error"),
    })
}
