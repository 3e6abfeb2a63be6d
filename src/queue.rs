//! Durable indexing job queue in SQLite.
//!
//! Job lifecycle:
//!
//! ```text
//! pending ──claim──▶ processing ──▶ completed
//!    ▲                   │
//!    └──reschedule/retry─┤
//!                        └──────▶ failed
//! ```
//!
//! Claiming is one conditional `UPDATE ... RETURNING` over the oldest
//! eligible row, so several worker processes sharing the database never
//! claim the same job. `attempts` counts failed executions only: a claim or
//! a lock-contention reschedule leaves it alone, a retryable failure or a
//! reclaimed stale job adds one.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::db::now_ms;
use crate::models::{IndexingJob, JobStatus};

/// Add a job for one document version.
///
/// A job for the same document that is still waiting to be claimed is
/// reused and pointed at the newer version instead of queueing a second one.
pub async fn enqueue_indexing_job(
    pool: &SqlitePool,
    workspace_id: &str,
    base_id: &str,
    document_id: &str,
    version_id: &str,
) -> Result<IndexingJob> {
    let now = now_ms();

    let existing = sqlx::query(
        r#"
        UPDATE indexing_jobs SET version_id = ?, updated_at = ?
        WHERE id = (
            SELECT id FROM indexing_jobs
            WHERE workspace_id = ? AND document_id = ? AND status = ?
            ORDER BY created_at DESC, rowid DESC LIMIT 1
        )
        RETURNING *
        "#,
    )
    .bind(version_id)
    .bind(now)
    .bind(workspace_id)
    .bind(document_id)
    .bind(JobStatus::Pending.as_str())
    .fetch_optional(pool)
    .await?;

    if let Some(row) = existing {
        let job = job_from_row(&row)?;
        tracing::debug!(job_id = %job.id, document_id, version_id, "pending job reused");
        return Ok(job);
    }

    let id = Uuid::new_v4().to_string();
    let row = sqlx::query(
        r#"
        INSERT INTO indexing_jobs
            (id, workspace_id, base_id, document_id, version_id, status, attempts,
             scheduled_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(workspace_id)
    .bind(base_id)
    .bind(document_id)
    .bind(version_id)
    .bind(JobStatus::Pending.as_str())
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("Failed to enqueue indexing job")?;

    tracing::info!(job_id = %id, workspace_id, base_id, document_id, version_id, "job enqueued");
    job_from_row(&row)
}

/// Atomically move the oldest eligible pending job to `processing`.
pub async fn claim_next_job(pool: &SqlitePool) -> Result<Option<IndexingJob>> {
    let now = now_ms();
    let row = sqlx::query(
        r#"
        UPDATE indexing_jobs SET status = ?, claimed_at = ?, updated_at = ?
        WHERE id = (
            SELECT id FROM indexing_jobs
            WHERE status = ? AND scheduled_at <= ?
            ORDER BY scheduled_at, created_at, rowid
            LIMIT 1
        )
        AND status = ?
        RETURNING *
        "#,
    )
    .bind(JobStatus::Processing.as_str())
    .bind(now)
    .bind(now)
    .bind(JobStatus::Pending.as_str())
    .bind(now)
    .bind(JobStatus::Pending.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Put a job back in the queue, eligible again from `not_before`.
/// Does not count as a failed attempt.
pub async fn reschedule_job(pool: &SqlitePool, id: &str, not_before: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE indexing_jobs
        SET status = ?, scheduled_at = ?, claimed_at = NULL, last_error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(JobStatus::Pending.as_str())
    .bind(not_before)
    .bind(reason)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delay before the next try after `attempts` failed executions:
/// `base * 2^(attempts - 1)`, capped at `backoff_max_ms`.
pub fn backoff_delay(config: &WorkerConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let delay = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_max_ms);
    Duration::from_millis(delay)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the queue, eligible at this epoch-millis timestamp.
    Rescheduled { attempts: u32, scheduled_at: i64 },
    /// Attempt ceiling reached.
    Failed { attempts: u32 },
}

/// Record a retryable failure: reschedule with backoff, or fail the job
/// once `max_attempts` executions have failed.
pub async fn retry_job(
    pool: &SqlitePool,
    job: &IndexingJob,
    error: &str,
    config: &WorkerConfig,
) -> Result<RetryOutcome> {
    let attempts = job.attempts + 1;

    if attempts >= config.max_attempts {
        let message = format!("giving up after {} attempts: {}", attempts, error);
        sqlx::query("UPDATE indexing_jobs SET attempts = ? WHERE id = ?")
            .bind(attempts as i64)
            .bind(&job.id)
            .execute(pool)
            .await?;
        fail_job(pool, &job.id, &message).await?;
        return Ok(RetryOutcome::Failed { attempts });
    }

    let scheduled_at = now_ms() + backoff_delay(config, attempts).as_millis() as i64;
    sqlx::query(
        r#"
        UPDATE indexing_jobs
        SET status = ?, attempts = ?, scheduled_at = ?, claimed_at = NULL, last_error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(JobStatus::Pending.as_str())
    .bind(attempts as i64)
    .bind(scheduled_at)
    .bind(error)
    .bind(now_ms())
    .bind(&job.id)
    .execute(pool)
    .await?;

    Ok(RetryOutcome::Rescheduled {
        attempts,
        scheduled_at,
    })
}

/// Terminal failure.
pub async fn fail_job(pool: &SqlitePool, id: &str, message: &str) -> Result<()> {
    let now = now_ms();
    sqlx::query(
        r#"
        UPDATE indexing_jobs
        SET status = ?, last_error = ?, finished_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(JobStatus::Failed.as_str())
    .bind(message)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn complete_job<'e, E>(executor: E, id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = now_ms();
    sqlx::query(
        r#"
        UPDATE indexing_jobs
        SET status = ?, last_error = NULL, finished_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(JobStatus::Completed.as_str())
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Return jobs stuck in `processing` longer than the visibility timeout to
/// the queue. Their worker is presumed dead, so the execution counts as a
/// failed attempt; jobs that run out of attempts this way are failed.
pub async fn recover_stale_jobs(pool: &SqlitePool, config: &WorkerConfig) -> Result<u64> {
    let now = now_ms();
    let cutoff = now - (config.visibility_timeout_secs as i64) * 1_000;

    let failed = sqlx::query(
        r#"
        UPDATE indexing_jobs
        SET status = ?, attempts = attempts + 1, finished_at = ?, updated_at = ?,
            last_error = 'worker stopped while processing; attempts exhausted'
        WHERE status = ? AND claimed_at <= ? AND attempts + 1 >= ?
        "#,
    )
    .bind(JobStatus::Failed.as_str())
    .bind(now)
    .bind(now)
    .bind(JobStatus::Processing.as_str())
    .bind(cutoff)
    .bind(config.max_attempts as i64)
    .execute(pool)
    .await?
    .rows_affected();

    let reclaimed = sqlx::query(
        r#"
        UPDATE indexing_jobs
        SET status = ?, attempts = attempts + 1, scheduled_at = ?, claimed_at = NULL, updated_at = ?,
            last_error = 'reclaimed stale job'
        WHERE status = ? AND claimed_at <= ?
        "#,
    )
    .bind(JobStatus::Pending.as_str())
    .bind(now)
    .bind(now)
    .bind(JobStatus::Processing.as_str())
    .bind(cutoff)
    .execute(pool)
    .await?
    .rows_affected();

    if reclaimed + failed > 0 {
        tracing::warn!(reclaimed, failed, "recovered stale indexing jobs");
    }
    Ok(reclaimed + failed)
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<IndexingJob>> {
    let row = sqlx::query("SELECT * FROM indexing_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Restricts job queries to one knowledge base and, optionally, to jobs
/// created at or after `since`.
#[derive(Debug, Clone, Default)]
pub struct JobScope<'a> {
    pub workspace_id: Option<&'a str>,
    pub base_id: Option<&'a str>,
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }
}

pub async fn count_by_status(pool: &SqlitePool, scope: &JobScope<'_>) -> Result<JobCounts> {
    let rows = sqlx::query(
        r#"
        SELECT status, COUNT(*) AS n FROM indexing_jobs
        WHERE (?1 IS NULL OR workspace_id = ?1)
          AND (?2 IS NULL OR base_id = ?2)
          AND (?3 IS NULL OR created_at >= ?3)
        GROUP BY status
        "#,
    )
    .bind(scope.workspace_id)
    .bind(scope.base_id)
    .bind(scope.since)
    .fetch_all(pool)
    .await?;

    let mut counts = JobCounts::default();
    for row in &rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match status.parse::<JobStatus>()? {
            JobStatus::Pending => counts.pending = n as u64,
            JobStatus::Processing => counts.processing = n as u64,
            JobStatus::Completed => counts.completed = n as u64,
            JobStatus::Failed => counts.failed = n as u64,
        }
    }
    Ok(counts)
}

/// Jobs in scope, newest first, optionally filtered by status.
pub async fn list_jobs(
    pool: &SqlitePool,
    scope: &JobScope<'_>,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<IndexingJob>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM indexing_jobs
        WHERE (?1 IS NULL OR workspace_id = ?1)
          AND (?2 IS NULL OR base_id = ?2)
          AND (?3 IS NULL OR created_at >= ?3)
          AND (?4 IS NULL OR status = ?4)
        ORDER BY updated_at DESC
        LIMIT ?5
        "#,
    )
    .bind(scope.workspace_id)
    .bind(scope.base_id)
    .bind(scope.since)
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

fn job_from_row(row: &SqliteRow) -> Result<IndexingJob> {
    let status: String = row.get("status");
    let attempts: i64 = row.get("attempts");
    Ok(IndexingJob {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        base_id: row.get("base_id"),
        document_id: row.get("document_id"),
        version_id: row.get("version_id"),
        status: status.parse()?,
        attempts: attempts as u32,
        last_error: row.get("last_error"),
        scheduled_at: row.get("scheduled_at"),
        claimed_at: row.get("claimed_at"),
        created_at: row.get("created_at"),
    })
}
