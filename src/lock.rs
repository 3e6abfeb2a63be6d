//! Per-document lock stored in SQLite.
//!
//! One row in `document_locks` per held lock, keyed by
//! `(workspace_id, document_id)`. Acquisition is a single conditional
//! upsert: it inserts the row, or takes over an existing row whose
//! `expires_at` has passed, and succeeds only if a row was written. Because
//! the row lives in the shared database, the lock holds across worker
//! processes.
//!
//! Every lock carries a TTL so a worker that died while holding one does not
//! block the document forever. The TTL must exceed the longest expected job.

use anyhow::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::now_ms;

/// Proof of a held lock. Pass it back to [`DocumentLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub workspace_id: String,
    pub document_id: String,
    pub holder: String,
}

#[derive(Clone)]
pub struct DocumentLock {
    pool: SqlitePool,
    ttl: Duration,
}

impl DocumentLock {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Try to take the lock without waiting. `None` means another holder has it.
    pub async fn acquire(&self, workspace_id: &str, document_id: &str) -> Result<Option<LockHandle>> {
        let holder = Uuid::new_v4().to_string();
        let now = now_ms();
        let expires_at = now + self.ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO document_locks (workspace_id, document_id, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, document_id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE document_locks.expires_at <= ?
            "#,
        )
        .bind(workspace_id)
        .bind(document_id)
        .bind(&holder)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(LockHandle {
            workspace_id: workspace_id.to_string(),
            document_id: document_id.to_string(),
            holder,
        }))
    }

    /// Release a lock. Releasing twice, or after the lock was taken over,
    /// is a no-op.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        sqlx::query(
            "DELETE FROM document_locks WHERE workspace_id = ? AND document_id = ? AND holder = ?",
        )
        .bind(&handle.workspace_id)
        .bind(&handle.document_id)
        .bind(&handle.holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether any live lock exists for the document.
    pub async fn is_locked(&self, workspace_id: &str, document_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM document_locks WHERE workspace_id = ? AND document_id = ? AND expires_at > ?",
        )
        .bind(workspace_id)
        .bind(document_id)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let lock = DocumentLock::new(pool().await, Duration::from_secs(60));
        let first = lock.acquire("ws", "doc").await.unwrap().unwrap();
        assert!(lock.acquire("ws", "doc").await.unwrap().is_none());
        assert!(lock.acquire("ws", "other").await.unwrap().is_some());

        lock.release(&first).await.unwrap();
        lock.release(&first).await.unwrap();
        assert!(lock.acquire("ws", "doc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let lock = DocumentLock::new(pool().await, Duration::ZERO);
        let stale = lock.acquire("ws", "doc").await.unwrap().unwrap();
        let fresh = lock.acquire("ws", "doc").await.unwrap().unwrap();
        assert_ne!(stale.holder, fresh.holder);

        // The stale holder's release must not free the new holder's lock.
        let lock = DocumentLock::new(lock.pool.clone(), Duration::from_secs(60));
        let live = lock.acquire("ws", "doc").await.unwrap().unwrap();
        lock.release(&stale).await.unwrap();
        assert!(lock.is_locked("ws", "doc").await.unwrap());
        lock.release(&live).await.unwrap();
        assert!(!lock.is_locked("ws", "doc").await.unwrap());
    }
}
