//! Indexing actions: run-level progress over many document jobs.
//!
//! An action covers every job of its knowledge base created at or after
//! the action itself. Its counters are never incremented in place; each
//! [`update_progress`] recounts the jobs in that window, so two workers
//! finishing jobs at the same time cannot skew the totals.
//!
//! Every write is conditional on the row version that was read. A worker
//! saving progress from a stale read re-reads and tries again instead of
//! overwriting a pause or cancel that landed in between.
//!
//! State machine:
//!
//! ```text
//! processing ──▶ done | error | paused | canceled
//! paused     ──▶ processing | canceled
//! ```
//!
//! `done`, `error` and `canceled` are terminal.

use anyhow::{bail, Context, Result};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::config::ActionsConfig;
use crate::db::now_ms;
use crate::models::{
    ActionEvent, ActionPayload, ActionStatus, FailedDocument, IndexingAction, JobStatus, RunConfig,
};
use crate::queue::{self, JobCounts, JobScope};

pub const STAGE_INDEXING: &str = "indexing";
pub const STAGE_PAUSED: &str = "paused";
pub const STAGE_CANCELED: &str = "canceled";
pub const STAGE_COMPLETED: &str = "completed";
pub const STAGE_FAILED: &str = "failed";
pub const STAGE_TIMED_OUT: &str = "timed_out";

const MAX_WRITE_ATTEMPTS: usize = 5;

/// Counters derived from the job counts of an action's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub percent: u8,
    /// Final status once no job in the window is pending or processing.
    pub outcome: Option<ActionStatus>,
}

/// `percent = round(completed / total * 100)`; the run is `done` iff no job
/// failed and every job completed, `error` otherwise.
pub fn compute_progress(counts: &JobCounts) -> Progress {
    let total = counts.total();
    let percent = if total == 0 {
        0
    } else {
        ((counts.completed as f64 / total as f64) * 100.0).round() as u8
    };

    let outcome = if total > 0 && counts.active() == 0 {
        if counts.failed == 0 && counts.completed == total {
            Some(ActionStatus::Done)
        } else {
            Some(ActionStatus::Error)
        }
    } else {
        None
    };

    Progress {
        total,
        processed: counts.completed + counts.failed,
        failed: counts.failed,
        percent,
        outcome,
    }
}

/// Append an event, dropping the oldest ones beyond `max_events`.
pub fn push_event(payload: &mut ActionPayload, event: ActionEvent, max_events: usize) {
    payload.events.push(event);
    if payload.events.len() > max_events {
        let excess = payload.events.len() - max_events;
        payload.events.drain(..excess);
    }
}

fn event(level: &str, message: impl Into<String>, document_id: Option<&str>) -> ActionEvent {
    ActionEvent {
        at: now_ms(),
        level: level.to_string(),
        message: message.into(),
        document_id: document_id.map(str::to_string),
    }
}

pub async fn start_action(
    pool: &SqlitePool,
    config: &ActionsConfig,
    workspace_id: &str,
    base_id: &str,
    run_config: RunConfig,
) -> Result<IndexingAction> {
    let now = now_ms();
    let mut payload = ActionPayload {
        config: run_config,
        ..Default::default()
    };
    push_event(&mut payload, event("info", "indexing started", None), config.max_events);

    let action = IndexingAction {
        action_id: Uuid::new_v4().to_string(),
        workspace_id: workspace_id.to_string(),
        base_id: base_id.to_string(),
        status: ActionStatus::Processing,
        stage: STAGE_INDEXING.to_string(),
        display_text: "Indexing started".to_string(),
        payload,
        created_at: now,
        processing_since: now,
        updated_at: now,
        row_version: 0,
    };

    sqlx::query(
        r#"
        INSERT INTO indexing_actions
            (action_id, workspace_id, base_id, status, stage, display_text, payload_json,
             created_at, processing_since, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&action.action_id)
    .bind(&action.workspace_id)
    .bind(&action.base_id)
    .bind(action.status.as_str())
    .bind(&action.stage)
    .bind(&action.display_text)
    .bind(serde_json::to_string(&action.payload)?)
    .bind(action.created_at)
    .bind(action.processing_since)
    .bind(action.updated_at)
    .execute(pool)
    .await
    .context("Failed to create indexing action")?;

    tracing::info!(action_id = %action.action_id, workspace_id, base_id, "action started");
    Ok(action)
}

pub async fn get_latest_action(
    pool: &SqlitePool,
    workspace_id: &str,
    base_id: &str,
) -> Result<Option<IndexingAction>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM indexing_actions
        WHERE workspace_id = ? AND base_id = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(workspace_id)
    .bind(base_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(action_from_row).transpose()
}

pub async fn get_action(pool: &SqlitePool, action_id: &str) -> Result<Option<IndexingAction>> {
    let row = sqlx::query("SELECT * FROM indexing_actions WHERE action_id = ?")
        .bind(action_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(action_from_row).transpose()
}

/// Recount the latest action's window and persist the result.
///
/// Returns the action as stored afterwards, or `None` if the knowledge base
/// has no action. Terminal actions are returned unchanged.
pub async fn update_progress(
    pool: &SqlitePool,
    config: &ActionsConfig,
    workspace_id: &str,
    base_id: &str,
) -> Result<Option<IndexingAction>> {
    let Some(action) = get_latest_action(pool, workspace_id, base_id).await? else {
        return Ok(None);
    };
    refresh(pool, config, action).await.map(Some)
}

/// Apply the timeout policy to every `processing` action, including ones
/// no job has touched recently. Returns how many were timed out.
pub async fn expire_timed_out(pool: &SqlitePool, config: &ActionsConfig) -> Result<u64> {
    let cutoff = now_ms() - (config.timeout_secs as i64) * 1_000;
    let rows = sqlx::query("SELECT * FROM indexing_actions WHERE status = ? AND processing_since < ?")
        .bind(ActionStatus::Processing.as_str())
        .bind(cutoff)
        .fetch_all(pool)
        .await?;

    let mut expired = 0;
    for row in &rows {
        let action = refresh(pool, config, action_from_row(row)?).await?;
        if action.stage == STAGE_TIMED_OUT {
            expired += 1;
        }
    }
    Ok(expired)
}

async fn refresh(
    pool: &SqlitePool,
    config: &ActionsConfig,
    mut action: IndexingAction,
) -> Result<IndexingAction> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        if action.status.is_terminal() {
            return Ok(action);
        }
        let mut next = action.clone();
        apply_progress(pool, config, &mut next).await?;
        if save(pool, &mut next).await? {
            return Ok(next);
        }
        action = get_action(pool, &action.action_id)
            .await?
            .with_context(|| format!("action {} disappeared", action.action_id))?;
    }
    tracing::warn!(action_id = %action.action_id, "action kept changing, progress not saved");
    Ok(action)
}

/// Recount the action's window into `action`, moving a `processing` action
/// to its final or timed-out state when due.
async fn apply_progress(
    pool: &SqlitePool,
    config: &ActionsConfig,
    action: &mut IndexingAction,
) -> Result<()> {
    let scope = JobScope {
        workspace_id: Some(&action.workspace_id),
        base_id: Some(&action.base_id),
        since: Some(action.created_at),
    };
    let counts = queue::count_by_status(pool, &scope).await?;
    let progress = compute_progress(&counts);

    action.payload.total_documents = progress.total;
    action.payload.processed_documents = progress.processed;
    action.payload.failed_documents = progress.failed;
    action.payload.progress_percent = progress.percent;

    if progress.failed > 0 {
        let failed_jobs = queue::list_jobs(
            pool,
            &scope,
            Some(JobStatus::Failed),
            config.max_failed_listed as i64,
        )
        .await?;
        action.payload.failed = failed_jobs
            .into_iter()
            .map(|job| FailedDocument {
                document_id: job.document_id,
                error: job.last_error.unwrap_or_default(),
            })
            .collect();
    }

    let now = now_ms();
    if action.status == ActionStatus::Processing {
        match progress.outcome {
            Some(ActionStatus::Done) => {
                action.status = ActionStatus::Done;
                action.stage = STAGE_COMPLETED.to_string();
                action.display_text = format!("Indexed {} documents", progress.total);
                push_event(
                    &mut action.payload,
                    event("info", "indexing completed", None),
                    config.max_events,
                );
            }
            Some(_) => {
                action.status = ActionStatus::Error;
                action.stage = STAGE_FAILED.to_string();
                action.display_text = format!(
                    "Indexing finished with {} failed of {} documents",
                    progress.failed, progress.total
                );
                push_event(
                    &mut action.payload,
                    event("error", action.display_text.clone(), None),
                    config.max_events,
                );
            }
            None if now - action.processing_since > (config.timeout_secs as i64) * 1_000 => {
                action.status = ActionStatus::Error;
                action.stage = STAGE_TIMED_OUT.to_string();
                action.display_text = format!(
                    "Indexing timed out after {}s at {}%",
                    config.timeout_secs, progress.percent
                );
                push_event(
                    &mut action.payload,
                    event("error", action.display_text.clone(), None),
                    config.max_events,
                );
                tracing::warn!(action_id = %action.action_id, "action timed out");
            }
            None => {
                action.display_text = format!(
                    "Indexed {} of {} documents ({}%)",
                    progress.processed, progress.total, progress.percent
                );
            }
        }
    }

    action.updated_at = now;
    Ok(())
}

/// Record a document-level event on an action without touching counters
/// or status.
pub async fn append_event(
    pool: &SqlitePool,
    config: &ActionsConfig,
    action_id: &str,
    level: &str,
    message: &str,
    document_id: Option<&str>,
) -> Result<()> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let Some(mut action) = get_action(pool, action_id).await? else {
            return Ok(());
        };
        push_event(&mut action.payload, event(level, message, document_id), config.max_events);

        let result = sqlx::query(
            r#"
            UPDATE indexing_actions
            SET payload_json = ?, updated_at = ?, row_version = row_version + 1
            WHERE action_id = ? AND row_version = ?
            "#,
        )
        .bind(serde_json::to_string(&action.payload)?)
        .bind(now_ms())
        .bind(action_id)
        .bind(action.row_version)
        .execute(pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
    }
    tracing::warn!(action_id, "action kept changing, event dropped");
    Ok(())
}

pub async fn pause_action(
    pool: &SqlitePool,
    config: &ActionsConfig,
    action_id: &str,
) -> Result<IndexingAction> {
    transition(pool, config, action_id, ActionStatus::Paused).await
}

pub async fn resume_action(
    pool: &SqlitePool,
    config: &ActionsConfig,
    action_id: &str,
) -> Result<IndexingAction> {
    transition(pool, config, action_id, ActionStatus::Processing).await
}

pub async fn cancel_action(
    pool: &SqlitePool,
    config: &ActionsConfig,
    action_id: &str,
) -> Result<IndexingAction> {
    transition(pool, config, action_id, ActionStatus::Canceled).await
}

async fn transition(
    pool: &SqlitePool,
    config: &ActionsConfig,
    action_id: &str,
    to: ActionStatus,
) -> Result<IndexingAction> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let mut action = get_action(pool, action_id)
            .await?
            .with_context(|| format!("action {} not found", action_id))?;

        let allowed = matches!(
            (action.status, to),
            (ActionStatus::Processing, ActionStatus::Paused)
                | (ActionStatus::Paused, ActionStatus::Processing)
                | (ActionStatus::Processing, ActionStatus::Canceled)
                | (ActionStatus::Paused, ActionStatus::Canceled)
        );
        if !allowed {
            bail!("cannot move action {} from {} to {}", action_id, action.status, to);
        }

        let now = now_ms();
        let (stage, message) = match to {
            ActionStatus::Paused => (STAGE_PAUSED, "indexing paused"),
            ActionStatus::Canceled => (STAGE_CANCELED, "indexing canceled"),
            _ => (STAGE_INDEXING, "indexing resumed"),
        };
        if to == ActionStatus::Processing {
            action.processing_since = now;
        }
        action.status = to;
        action.stage = stage.to_string();
        action.display_text = capitalize(message);
        action.updated_at = now;
        push_event(&mut action.payload, event("info", message, None), config.max_events);

        if save(pool, &mut action).await? {
            tracing::info!(action_id, status = %to, "action status changed");
            return Ok(action);
        }
    }
    bail!("action {} kept changing, could not move it to {}", action_id, to)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Write `action` back if nobody changed it since it was read. Returns
/// `false` on a lost race.
async fn save(pool: &SqlitePool, action: &mut IndexingAction) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE indexing_actions
        SET status = ?, stage = ?, display_text = ?, payload_json = ?, processing_since = ?,
            updated_at = ?, row_version = row_version + 1
        WHERE action_id = ? AND row_version = ?
        "#,
    )
    .bind(action.status.as_str())
    .bind(&action.stage)
    .bind(&action.display_text)
    .bind(serde_json::to_string(&action.payload)?)
    .bind(action.processing_since)
    .bind(action.updated_at)
    .bind(&action.action_id)
    .bind(action.row_version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }
    action.row_version += 1;
    Ok(true)
}

fn action_from_row(row: &SqliteRow) -> Result<IndexingAction> {
    let status: String = row.get("status");
    let payload_json: String = row.get("payload_json");
    Ok(IndexingAction {
        action_id: row.get("action_id"),
        workspace_id: row.get("workspace_id"),
        base_id: row.get("base_id"),
        status: status.parse()?,
        stage: row.get("stage"),
        display_text: row.get("display_text"),
        payload: serde_json::from_str(&payload_json).context("Corrupt action payload")?,
        created_at: row.get("created_at"),
        processing_since: row.get("processing_since"),
        updated_at: row.get("updated_at"),
        row_version: row.get("row_version"),
    })
}
