//! Per-job indexing pipeline.
//!
//! One claimed job runs these steps under the document lock:
//!
//! 1. resolve the effective policy and the embedding provider
//! 2. open a `processing` revision
//! 3. chunk the document
//! 4. consult the usage guard
//! 5. obtain an access token
//! 6. embed every chunk, one after another
//! 7. ensure the collection exists with the embedding's dimensionality
//! 8. render one point per chunk
//! 9. upsert all points in one batch
//! 10. in one transaction: switch the document's current revision, mark
//!     the revision ready, complete the job, mark the document up to date
//! 11. delete the document's points from every other revision (best effort)
//!
//! Each step returns `Result<_, JobError>` and the first failure
//! short-circuits the rest. The lock is released after the outcome has been
//! recorded, whichever step failed.
//!
//! Before taking the lock the job's action is checked: a paused action
//! sends the job back to the queue, a canceled one fails it.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::action;
use crate::chunk::{Chunker, SqliteChunker};
use crate::config::Config;
use crate::db::now_ms;
use crate::documents;
use crate::embedding::{EmbeddingClient, HttpEmbeddingClient};
use crate::error::{EmbeddingError, JobError};
use crate::lock::DocumentLock;
use crate::models::{ActionStatus, IndexingJob, RunConfig};
use crate::payload::{PayloadRenderer, PointScope};
use crate::policy::{self, ProviderRegistry, UsageContext, UsageGuard};
use crate::queue::{self, RetryOutcome};
use crate::revision::{self, RevisionPatch};
use crate::token::TokenService;
use crate::ttl_store::TtlStore;
use crate::vector_store::{QdrantStore, VectorFilter, VectorStore};

/// Everything a job needs, shared by all jobs of a worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub vector_store: Arc<dyn VectorStore>,
    pub chunker: Arc<dyn Chunker>,
    pub usage_guard: Arc<dyn UsageGuard>,
    pub tokens: Arc<TokenService>,
    pub lock: DocumentLock,
}

impl PipelineContext {
    /// Production wiring: HTTP embeddings, Qdrant, SQLite chunker.
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let lock = DocumentLock::new(
            pool.clone(),
            Duration::from_secs(config.worker.lock_ttl_secs),
        );
        Self {
            embedder: Arc::new(HttpEmbeddingClient::new()),
            vector_store: Arc::new(QdrantStore::new(&config.vector_store)),
            chunker: Arc::new(SqliteChunker::new(pool.clone())),
            usage_guard: policy::guard_from_config(&config.usage),
            tokens: Arc::new(TokenService::new(Arc::new(TtlStore::new()))),
            lock,
            config: Arc::new(config),
            pool,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingClient>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = store;
        self
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_usage_guard(mut self, guard: Arc<dyn UsageGuard>) -> Self {
        self.usage_guard = guard;
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<TokenService>) -> Self {
        self.tokens = tokens;
        self
    }
}

/// How a claimed job left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        revision_id: String,
        previous_revision_id: Option<String>,
        chunk_count: usize,
        /// Points removed by cleanup; `None` if cleanup failed.
        cleaned: Option<u64>,
    },
    /// Another job holds the document; retried at `retry_at`.
    LockBusy { retry_at: i64 },
    /// The action is paused; retried at `retry_at`.
    Paused { retry_at: i64 },
    /// Retryable failure, rescheduled with backoff.
    Retrying { attempts: u32, retry_at: i64 },
    Failed { error: String },
}

impl JobOutcome {
    /// Whether the job made progress, so the worker should poll again at once.
    pub fn handled(&self) -> bool {
        !matches!(self, JobOutcome::LockBusy { .. } | JobOutcome::Paused { .. })
    }
}

/// Collection holding a workspace's vectors.
pub fn collection_name(prefix: &str, workspace_id: &str) -> String {
    let sanitized: String = workspace_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_ws_{}", prefix, sanitized)
}

/// Run one claimed job to its outcome. `Err` is returned only when the
/// outcome itself could not be recorded.
pub async fn process_job(ctx: &PipelineContext, job: &IndexingJob) -> Result<JobOutcome> {
    let action = action::get_latest_action(&ctx.pool, &job.workspace_id, &job.base_id).await?;

    let mut run_config = RunConfig::default();
    if let Some(action) = &action {
        match action.status {
            ActionStatus::Paused => {
                let retry_at = now_ms() + ctx.config.worker.pause_recheck_ms as i64;
                queue::reschedule_job(&ctx.pool, &job.id, retry_at, "action paused").await?;
                tracing::debug!(job_id = %job.id, action_id = %action.action_id, "action paused, job deferred");
                return Ok(JobOutcome::Paused { retry_at });
            }
            ActionStatus::Canceled => {
                tracing::info!(job_id = %job.id, action_id = %action.action_id, "job canceled");
                let err = JobError::Canceled(format!("action {} was canceled", action.action_id));
                let outcome = record_failure(ctx, job, None, &err).await?;
                refresh_progress(ctx, job).await;
                return Ok(outcome);
            }
            ActionStatus::Processing => run_config = action.payload.config.clone(),
            ActionStatus::Done | ActionStatus::Error => {}
        }
    }

    let Some(handle) = ctx.lock.acquire(&job.workspace_id, &job.document_id).await? else {
        let retry_at = now_ms() + ctx.config.worker.lock_retry_delay_ms as i64;
        queue::reschedule_job(&ctx.pool, &job.id, retry_at, "document is being indexed by another job")
            .await?;
        tracing::debug!(job_id = %job.id, document_id = %job.document_id, "document locked, job deferred");
        return Ok(JobOutcome::LockBusy { retry_at });
    };

    let outcome = run_locked(ctx, job, &run_config).await;

    if let Err(e) = ctx.lock.release(&handle).await {
        tracing::warn!(job_id = %job.id, document_id = %job.document_id, error = %e, "failed to release document lock");
    }

    outcome
}

async fn run_locked(ctx: &PipelineContext, job: &IndexingJob, run: &RunConfig) -> Result<JobOutcome> {
    let mut revision_id = None;
    let outcome = match run_steps(ctx, job, run, &mut revision_id).await {
        Ok(outcome) => outcome,
        Err(err) => record_failure(ctx, job, revision_id.as_deref(), &err).await?,
    };
    refresh_progress(ctx, job).await;
    Ok(outcome)
}

async fn refresh_progress(ctx: &PipelineContext, job: &IndexingJob) {
    if let Err(e) = action::update_progress(
        &ctx.pool,
        &ctx.config.actions,
        &job.workspace_id,
        &job.base_id,
    )
    .await
    {
        tracing::warn!(job_id = %job.id, error = %e, "failed to update action progress");
    }
}

async fn run_steps(
    ctx: &PipelineContext,
    job: &IndexingJob,
    run: &RunConfig,
    revision_id: &mut Option<String>,
) -> Result<JobOutcome, JobError> {
    let pool = &ctx.pool;

    // Provider and policy
    let policy = policy::effective_policy(&ctx.config, &job.base_id, run)?;
    let registry = ProviderRegistry::new(&ctx.config);
    let status = registry.resolve_provider_status(&policy.provider_id);
    if !status.is_configured {
        return Err(JobError::fatal(format!(
            "embedding provider unavailable: {}",
            status.status_reason.unwrap_or_default()
        )));
    }
    let provider = registry
        .get_provider(&policy.provider_id, policy.model.as_deref())
        .ok_or_else(|| JobError::fatal(format!("provider '{}' not found", policy.provider_id)))?;

    // Revision
    let revision = revision::create_revision(
        pool,
        &job.workspace_id,
        &job.document_id,
        &job.version_id,
        &policy::policy_hash(&policy),
    )
    .await?;
    *revision_id = Some(revision.id.clone());

    // Chunks
    let set = ctx
        .chunker
        .chunk_document(&job.workspace_id, &job.document_id, &revision.id, policy.chunking())
        .await?;
    if set.chunks.is_empty() {
        return Err(JobError::fatal("document produced no chunks"));
    }
    revision::update_revision(
        pool,
        &revision.id,
        RevisionPatch {
            chunk_set_id: Some(set.id.clone()),
            chunk_count: Some(set.chunks.len() as i64),
            total_tokens: Some(set.total_tokens()),
            total_chars: Some(set.total_chars()),
            ..Default::default()
        },
    )
    .await?;

    // Usage gate
    if ctx.config.usage.enabled {
        let decision = ctx
            .usage_guard
            .check(&UsageContext {
                workspace_id: &job.workspace_id,
                base_id: &job.base_id,
                document_id: &job.document_id,
                operation: "embed",
                chunk_count: set.chunks.len(),
            })
            .await?;
        if !decision.allowed {
            return Err(JobError::fatal(format!(
                "usage limit reached ({}): {}",
                decision.reason_code.unwrap_or_default(),
                decision.message.unwrap_or_default()
            )));
        }
    }

    // Embeddings
    let token = ctx
        .tokens
        .access_token(&provider)
        .await
        .map_err(|e| JobError::from_token(&e))?;

    let total = set.chunks.len();
    let mut vectors = Vec::with_capacity(total);
    let mut usage_tokens = Some(0_u64);
    for (i, chunk) in set.chunks.iter().enumerate() {
        let embedding = ctx
            .embedder
            .embed(&provider, token.as_deref(), &chunk.text)
            .await
            .map_err(|e| {
                if matches!(e, EmbeddingError::Api { status: 401, .. }) {
                    ctx.tokens.invalidate(&provider.id);
                }
                JobError::from_embedding(&e, i + 1, total)
            })?;

        if let Some(first) = vectors.first().map(|v: &Vec<f32>| v.len()) {
            if embedding.vector.len() != first {
                return Err(JobError::fatal(format!(
                    "embedding for chunk {} of {} has {} dimensions, expected {}",
                    i + 1,
                    total,
                    embedding.vector.len(),
                    first
                )));
            }
        }
        usage_tokens = usage_tokens.zip(embedding.usage_tokens).map(|(a, b)| a + b);
        vectors.push(embedding.vector);
    }
    tracing::debug!(job_id = %job.id, chunks = total, "chunks embedded");

    // Upload
    let collection = collection_name(&ctx.config.vector_store.collection_prefix, &job.workspace_id);
    let dims = vectors[0].len();
    ctx.vector_store
        .ensure_collection(&collection, dims)
        .await
        .map_err(|e| JobError::fatal(format!("ensure collection failed: {}", e)))?;

    let renderer = PayloadRenderer::new(&policy.schema_fields)?;
    let scope = PointScope {
        workspace_id: &job.workspace_id,
        base_id: &job.base_id,
        document_id: &job.document_id,
        version_id: &job.version_id,
        revision_id: &revision.id,
        chunk_set_id: &set.id,
    };
    let points = set
        .chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| renderer.build_point(&scope, chunk, vector))
        .collect::<Result<Vec<_>>>()?;

    ctx.vector_store
        .upsert(&collection, &points)
        .await
        .map_err(|e| JobError::fatal(format!("upsert failed: {}", e)))?;

    // Switch
    if let Some(tokens) = usage_tokens {
        revision::update_revision(
            pool,
            &revision.id,
            RevisionPatch {
                total_tokens: Some(tokens as i64),
                ..Default::default()
            },
        )
        .await?;
    }

    let mut tx = pool.begin().await?;
    let switched = revision::switch_current_revision(
        &mut *tx,
        &job.workspace_id,
        &job.document_id,
        &revision.id,
        &set.id,
    )
    .await?;
    revision::mark_ready(&mut *tx, &revision.id).await?;
    queue::complete_job(&mut *tx, &job.id).await?;
    documents::mark_up_to_date(&mut *tx, &job.workspace_id, &job.document_id, &job.version_id)
        .await?;
    tx.commit().await?;

    // From here on the revision is current; nothing below may fail the job
    *revision_id = None;

    tracing::info!(
        job_id = %job.id,
        document_id = %job.document_id,
        revision_id = %revision.id,
        previous_revision_id = ?switched.previous_revision_id,
        chunks = total,
        "revision switched in"
    );

    // Cleanup
    let filter = VectorFilter::new()
        .must("workspace_id", &job.workspace_id)
        .must("document_id", &job.document_id)
        .must_not("revision_id", &revision.id);
    let cleaned = match ctx.vector_store.delete_by_filter(&collection, &filter).await {
        Ok(n) => {
            tracing::debug!(document_id = %job.document_id, deleted = n, "stale vectors deleted");
            Some(n)
        }
        Err(e) => {
            tracing::warn!(document_id = %job.document_id, revision_id = %revision.id, error = %e, "stale vector cleanup failed");
            None
        }
    };

    Ok(JobOutcome::Completed {
        revision_id: revision.id,
        previous_revision_id: switched.previous_revision_id,
        chunk_count: total,
        cleaned,
    })
}

async fn record_failure(
    ctx: &PipelineContext,
    job: &IndexingJob,
    revision_id: Option<&str>,
    err: &JobError,
) -> Result<JobOutcome> {
    let message = err.message();
    let pool = &ctx.pool;

    if let Some(revision_id) = revision_id {
        if !revision::mark_failed(pool, revision_id, &message).await? {
            tracing::debug!(revision_id, "revision no longer processing, left as is");
        }
    }

    let outcome = if err.is_retryable() {
        match queue::retry_job(pool, job, &message, &ctx.config.worker).await? {
            RetryOutcome::Rescheduled {
                attempts,
                scheduled_at,
            } => {
                tracing::warn!(job_id = %job.id, attempts, error = %message, "job failed, retrying");
                return Ok(JobOutcome::Retrying {
                    attempts,
                    retry_at: scheduled_at,
                });
            }
            RetryOutcome::Failed { attempts } => {
                let error = format!("giving up after {} attempts: {}", attempts, message);
                JobOutcome::Failed { error }
            }
        }
    } else {
        queue::fail_job(pool, &job.id, &message).await?;
        JobOutcome::Failed {
            error: message.clone(),
        }
    };

    if let JobOutcome::Failed { error } = &outcome {
        documents::mark_error(pool, &job.workspace_id, &job.document_id, error).await?;
        tracing::error!(job_id = %job.id, document_id = %job.document_id, error = %error, "job failed");

        if let Some(action) =
            action::get_latest_action(pool, &job.workspace_id, &job.base_id).await?
        {
            action::append_event(
                pool,
                &ctx.config.actions,
                &action.action_id,
                "error",
                error,
                Some(&job.document_id),
            )
            .await?;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_are_sanitized() {
        assert_eq!(collection_name("kb", "acme"), "kb_ws_acme");
        assert_eq!(collection_name("kb", "a b/c"), "kb_ws_a_b_c");
    }

    #[test]
    fn only_deferred_jobs_are_unhandled() {
        assert!(!JobOutcome::LockBusy { retry_at: 0 }.handled());
        assert!(!JobOutcome::Paused { retry_at: 0 }.handled());
        assert!(JobOutcome::Failed { error: "x".into() }.handled());
        assert!(JobOutcome::Retrying {
            attempts: 1,
            retry_at: 0
        }
        .handled());
    }
}
