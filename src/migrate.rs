//! Schema migrations.
//!
//! All statements are idempotent (`IF NOT EXISTS`), so `kbx init` can be
//! run any number of times against the same database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an already-open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Document content and its "current revision" pointer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            base_id TEXT NOT NULL,
            body TEXT NOT NULL,
            version_id TEXT NOT NULL,
            current_revision_id TEXT,
            current_chunk_set_id TEXT,
            previous_revision_id TEXT,
            indexed_version_id TEXT,
            index_status TEXT NOT NULL DEFAULT 'pending',
            index_error TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (workspace_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_jobs (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            base_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            scheduled_at INTEGER NOT NULL,
            claimed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_actions (
            action_id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            base_id TEXT NOT NULL,
            status TEXT NOT NULL,
            stage TEXT NOT NULL,
            display_text TEXT NOT NULL DEFAULT '',
            payload_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            processing_since INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            row_version INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_index_revisions (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            policy_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            chunk_set_id TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_chars INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_sets (
            id TEXT PRIMARY KEY,
            revision_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            chunk_set_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            char_count INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            vector_id TEXT NOT NULL,
            UNIQUE(chunk_set_id, chunk_ordinal),
            FOREIGN KEY (chunk_set_id) REFERENCES chunk_sets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per held lock; the primary key is the mutual-exclusion key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_locks (
            workspace_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (workspace_id, document_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON indexing_jobs(status, scheduled_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_scope ON indexing_jobs(workspace_id, base_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_actions_scope ON indexing_actions(workspace_id, base_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_revisions_document ON document_index_revisions(document_id, started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_set ON chunks(chunk_set_id)")
        .execute(pool)
        .await?;

    Ok(())
}
