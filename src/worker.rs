//! Worker poll loop.
//!
//! Each iteration recovers stale jobs, times out stalled actions, then
//! claims at most one job and runs it through the pipeline. After a job
//! that made progress the loop polls again immediately to drain a backlog;
//! after an empty poll, a deferred job or an error it waits
//! `poll_interval_ms`. Errors are logged and never end the loop; only
//! [`WorkerHandle::stop`] does.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::action;
use crate::db::now_ms;
use crate::pipeline::{self, JobOutcome, PipelineContext};
use crate::queue;
use crate::revision;
use crate::ttl_store;

const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Returned by [`start_worker`]; stops the loop between jobs.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    token_sweeper: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the loop to stop and wait for the in-flight job to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "worker task ended abnormally");
        }
        self.token_sweeper.abort();
    }
}

/// Spawn the poll loop on the current tokio runtime.
pub fn start_worker(ctx: PipelineContext) -> WorkerHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let token_sweeper =
        ttl_store::spawn_sweeper(ctx.tokens.cache().clone(), TOKEN_SWEEP_INTERVAL);
    let task = tokio::spawn(async move {
        let idle = Duration::from_millis(ctx.config.worker.poll_interval_ms);
        tracing::info!(poll_interval_ms = ctx.config.worker.poll_interval_ms, "worker started");

        loop {
            if *stopped.borrow() {
                break;
            }

            let delay = match poll_once(&ctx).await {
                Ok(Some(outcome)) if outcome.handled() => Duration::ZERO,
                Ok(_) => idle,
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "worker iteration failed");
                    idle
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped.changed() => {}
            }
        }

        tracing::info!("worker stopped");
    });

    WorkerHandle {
        shutdown,
        task,
        token_sweeper,
    }
}

/// One poll iteration: housekeeping, then at most one job.
/// Returns `None` when no job was eligible.
pub async fn poll_once(ctx: &PipelineContext) -> Result<Option<JobOutcome>> {
    housekeeping(ctx).await;

    let Some(job) = queue::claim_next_job(&ctx.pool).await? else {
        return Ok(None);
    };

    let span = tracing::info_span!("job", job_id = %job.id, document_id = %job.document_id);
    let outcome = async {
        tracing::debug!(attempts = job.attempts, version_id = %job.version_id, "job claimed");
        let outcome = pipeline::process_job(ctx, &job).await?;
        match &outcome {
            JobOutcome::Completed {
                revision_id,
                chunk_count,
                ..
            } => tracing::info!(revision_id = %revision_id, chunks = chunk_count, "job completed"),
            JobOutcome::Failed { error } => tracing::warn!(error = %error, "job failed"),
            _ => {}
        }
        anyhow::Ok(outcome)
    }
    .instrument(span)
    .await?;
    Ok(Some(outcome))
}

/// Best-effort recovery work; failures are logged only.
async fn housekeeping(ctx: &PipelineContext) {
    let worker = &ctx.config.worker;
    if let Err(e) = queue::recover_stale_jobs(&ctx.pool, worker).await {
        tracing::warn!(error = %e, "stale job recovery failed");
    }

    let abandoned_before = now_ms() - (worker.lock_ttl_secs as i64) * 1_000;
    if let Err(e) = revision::fail_abandoned(&ctx.pool, abandoned_before).await {
        tracing::warn!(error = %e, "abandoned revision sweep failed");
    }

    if let Err(e) = action::expire_timed_out(&ctx.pool, &ctx.config.actions).await {
        tracing::warn!(error = %e, "action timeout check failed");
    }
}
