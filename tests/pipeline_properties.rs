//! End-to-end tests of the indexing pipeline against a real SQLite file.
//!
//! Embeddings come from a scripted client (or a wiremock server where the
//! HTTP path matters) and vectors land in [`InMemoryVectorStore`], so every
//! test can inspect exactly which points exist after a job.

use async_trait::async_trait;
use kb_indexer::action;
use kb_indexer::config::{parse_config, Config, ProviderConfig};
use kb_indexer::documents;
use kb_indexer::embedding::{Embedding, EmbeddingClient, HttpEmbeddingClient};
use kb_indexer::error::EmbeddingError;
use kb_indexer::migrate;
use kb_indexer::models::{ActionStatus, JobStatus, RevisionStatus, RunConfig};
use kb_indexer::pipeline::{collection_name, process_job, JobOutcome, PipelineContext};
use kb_indexer::queue;
use kb_indexer::revision;
use kb_indexer::sweep;
use kb_indexer::vector_store::{InMemoryVectorStore, VectorFilter};
use kb_indexer::worker;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WS: &str = "acme";
const BASE: &str = "handbook";
const DIMS: usize = 4;

// ─── Test Embedder ──────────────────────────────────────────────────

/// Returns a constant vector per call, or a transport error on every call
/// when `fail_transport` is set. `delay` is slept before each answer.
struct ScriptedEmbedder {
    calls: AtomicUsize,
    fail_transport: bool,
    delay: Duration,
}

impl ScriptedEmbedder {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_transport: false,
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_transport: false,
            delay,
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_transport: true,
            delay: Duration::ZERO,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedEmbedder {
    async fn embed(
        &self,
        _provider: &ProviderConfig,
        _access_token: Option<&str>,
        text: &str,
    ) -> Result<Embedding, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_transport {
            return Err(EmbeddingError::Transport("connection refused".into()));
        }
        Ok(Embedding {
            vector: vec![text.len() as f32; DIMS],
            usage_tokens: Some(2),
            embedding_id: None,
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn test_config(tmp: &TempDir, provider_url: &str, extra: &str) -> Config {
    let text = format!(
        r#"[db]
path = "{}/data/kb.sqlite"

[worker]
poll_interval_ms = 20
max_attempts = 3
backoff_base_ms = 10
backoff_max_ms = 40
lock_retry_delay_ms = 60000
pause_recheck_ms = 60000

[policy]
provider_id = "local"
chunk_size = 100
chunk_overlap = 0

[[providers]]
id = "local"
kind = "ollama"
url = "{}"
model = "nomic-embed-text"

[vector_store]
url = "http://127.0.0.1:6333"
{}
"#,
        tmp.path().display(),
        provider_url,
        extra
    );
    parse_config(&text).unwrap()
}

struct Harness {
    _tmp: TempDir,
    pool: SqlitePool,
    store: Arc<InMemoryVectorStore>,
    ctx: PipelineContext,
}

impl Harness {
    async fn new() -> Self {
        Self::with(ScriptedEmbedder::ok(), "http://127.0.0.1:11434/api/embed", "").await
    }

    async fn with(embedder: Arc<dyn EmbeddingClient>, provider_url: &str, extra: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp, provider_url, extra);
        let pool = kb_indexer::db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();

        let store = Arc::new(InMemoryVectorStore::new());
        let ctx = PipelineContext::new(pool.clone(), config)
            .with_embedder(embedder)
            .with_vector_store(store.clone());

        Self {
            _tmp: tmp,
            pool,
            store,
            ctx,
        }
    }

    /// Store `paragraphs` paragraphs as a new version and queue it. With
    /// `chunk_size = 100` every paragraph becomes exactly one chunk.
    async fn put(&self, document_id: &str, version_id: &str, paragraphs: usize) -> String {
        let body = (0..paragraphs)
            .map(|i| format!("p{:02}{}", i, "x".repeat(57)))
            .collect::<Vec<_>>()
            .join("\n\n");
        documents::put_document(&self.pool, WS, BASE, document_id, version_id, &body)
            .await
            .unwrap();
        queue::enqueue_indexing_job(&self.pool, WS, BASE, document_id, version_id)
            .await
            .unwrap()
            .id
    }

    async fn run_one(&self) -> JobOutcome {
        worker::poll_once(&self.ctx)
            .await
            .unwrap()
            .expect("a job should be eligible")
    }

    fn collection(&self) -> String {
        collection_name("kb", WS)
    }

    fn points_of_revision(&self, revision_id: &str) -> usize {
        self.store
            .points(
                &self.collection(),
                &VectorFilter::new().must("revision_id", revision_id),
            )
            .len()
    }

    fn points_of_document(&self, document_id: &str) -> usize {
        self.store
            .points(
                &self.collection(),
                &VectorFilter::new().must("document_id", document_id),
            )
            .len()
    }

    async fn make_due(&self, job_id: &str) {
        sqlx::query("UPDATE indexing_jobs SET scheduled_at = 0 WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .unwrap();
    }
}

fn completed_revision(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Completed { revision_id, .. } => revision_id.clone(),
        other => panic!("expected completion, got {:?}", other),
    }
}

// ─── Happy path and switchover ──────────────────────────────────────

#[tokio::test]
async fn first_run_indexes_document_and_switches_it_in() {
    let h = Harness::new().await;
    let job_id = h.put("intro", "v1", 3).await;

    let outcome = h.run_one().await;
    let JobOutcome::Completed {
        revision_id,
        previous_revision_id,
        chunk_count,
        cleaned,
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(chunk_count, 3);
    assert_eq!(previous_revision_id, None);
    assert_eq!(cleaned, Some(0));

    let doc = documents::get_document(&h.pool, WS, "intro").await.unwrap().unwrap();
    assert_eq!(doc.current_revision_id.as_deref(), Some(revision_id.as_str()));
    assert_eq!(doc.indexed_version_id.as_deref(), Some("v1"));
    assert_eq!(doc.index_status, documents::STATUS_READY);

    let rev = revision::get_revision(&h.pool, &revision_id).await.unwrap().unwrap();
    assert_eq!(rev.status, RevisionStatus::Ready);
    assert_eq!(rev.chunk_count, 3);
    assert_eq!(rev.total_tokens, 6, "usage reported by the provider wins");
    assert_eq!(doc.current_chunk_set_id, rev.chunk_set_id);

    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 0);

    assert_eq!(h.store.vector_size(&h.collection()), Some(DIMS));
    let points = h.store.points(
        &h.collection(),
        &VectorFilter::new().must("revision_id", &revision_id),
    );
    assert_eq!(points.len(), 3);
    for point in &points {
        assert_eq!(point.payload["workspace_id"], WS);
        assert_eq!(point.payload["base_id"], BASE);
        assert_eq!(point.payload["document_id"], "intro");
        assert_eq!(point.payload["version_id"], "v1");
        assert!(point.payload["text"].as_str().unwrap().starts_with('p'));
    }
    assert!(!h.ctx.lock.is_locked(WS, "intro").await.unwrap());
}

#[tokio::test]
async fn reindex_switches_revision_and_removes_old_vectors() {
    let h = Harness::new().await;
    h.put("intro", "v1", 10).await;
    let r1 = completed_revision(&h.run_one().await);
    assert_eq!(h.points_of_revision(&r1), 10);

    h.put("intro", "v2", 12).await;
    let outcome = h.run_one().await;
    let JobOutcome::Completed {
        revision_id: r2,
        previous_revision_id,
        cleaned,
        ..
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(previous_revision_id.as_deref(), Some(r1.as_str()));
    assert_eq!(cleaned, Some(10));

    assert_eq!(h.points_of_revision(&r1), 0);
    assert_eq!(h.points_of_revision(&r2), 12);
    assert_eq!(h.points_of_document("intro"), 12);

    let current = revision::get_current_revision(&h.pool, WS, "intro")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.id, r2);
    assert_eq!(current.version_id, "v2");

    let revisions = revision::list_revisions(&h.pool, WS, "intro").await.unwrap();
    assert_eq!(revisions.len(), 2);
    assert!(revisions.iter().all(|r| r.status == RevisionStatus::Ready));
}

#[tokio::test]
async fn cleanup_failure_still_completes_and_sweep_removes_leftovers() {
    let h = Harness::new().await;
    h.put("intro", "v1", 4).await;
    let r1 = completed_revision(&h.run_one().await);

    h.store.set_fail_deletes(true);
    h.put("intro", "v2", 2).await;
    let outcome = h.run_one().await;
    let JobOutcome::Completed {
        revision_id: r2,
        cleaned,
        ..
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(cleaned, None);

    let doc = documents::get_document(&h.pool, WS, "intro").await.unwrap().unwrap();
    assert_eq!(doc.current_revision_id.as_deref(), Some(r2.as_str()));
    assert_eq!(h.points_of_revision(&r1), 4, "old vectors are left behind");

    h.store.set_fail_deletes(false);
    let report = sweep::sweep_orphans(&h.pool, &h.ctx.config, h.store.as_ref())
        .await
        .unwrap();
    assert_eq!(report.documents, 1);
    assert_eq!(report.deleted, 4);
    assert_eq!(report.failures, 0);
    assert_eq!(h.points_of_revision(&r1), 0);
    assert_eq!(h.points_of_revision(&r2), 2);
}

// ─── Failure paths ──────────────────────────────────────────────────

#[tokio::test]
async fn embedding_error_mid_document_leaves_current_revision_untouched() {
    let server = MockServer::start().await;
    // 5 chunks of v1 plus the first 2 of v2 succeed, then the provider breaks
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[0.1, 0.2, 0.3, 0.4]],
            "prompt_eval_count": 3
        })))
        .up_to_n_times(7)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;

    let url = format!("{}/api/embed", server.uri());
    let h = Harness::with(Arc::new(HttpEmbeddingClient::new()), &url, "").await;

    h.put("intro", "v1", 5).await;
    let r1 = completed_revision(&h.run_one().await);

    let started = action::start_action(&h.pool, &h.ctx.config.actions, WS, BASE, RunConfig::default())
        .await
        .unwrap();
    let job_id = h.put("intro", "v2", 5).await;

    let outcome = h.run_one().await;
    let JobOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("chunk 3 of 5"), "{}", error);

    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 0, "HTTP errors are not retried");

    let revisions = revision::list_revisions(&h.pool, WS, "intro").await.unwrap();
    let failed = revisions.iter().find(|r| r.id != r1).unwrap();
    assert_eq!(failed.status, RevisionStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("chunk 3 of 5"));
    assert_eq!(h.points_of_revision(&failed.id), 0);

    let doc = documents::get_document(&h.pool, WS, "intro").await.unwrap().unwrap();
    assert_eq!(doc.current_revision_id.as_deref(), Some(r1.as_str()));
    assert_eq!(doc.indexed_version_id.as_deref(), Some("v1"));
    assert_eq!(doc.index_status, documents::STATUS_ERROR);
    assert_eq!(h.points_of_revision(&r1), 5);
    assert!(!h.ctx.lock.is_locked(WS, "intro").await.unwrap());

    let action = action::get_action(&h.pool, &started.action_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.status, ActionStatus::Error);
    assert_eq!(action.payload.failed_documents, 1);
    assert_eq!(action.payload.failed[0].document_id, "intro");
    assert!(action
        .payload
        .events
        .iter()
        .any(|e| e.level == "error" && e.document_id.as_deref() == Some("intro")));
}

#[tokio::test]
async fn upsert_failure_is_fatal_and_keeps_previous_revision() {
    let h = Harness::new().await;
    h.put("intro", "v1", 2).await;
    let r1 = completed_revision(&h.run_one().await);

    h.store.set_fail_upserts(true);
    let job_id = h.put("intro", "v2", 3).await;
    let outcome = h.run_one().await;
    let JobOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.starts_with("upsert failed"), "{}", error);

    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let current = revision::get_current_revision(&h.pool, WS, "intro")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.id, r1);
    assert_eq!(h.points_of_document("intro"), 2);
}

#[tokio::test]
async fn transport_errors_back_off_then_give_up() {
    let embedder = ScriptedEmbedder::unreachable();
    let h = Harness::with(embedder.clone(), "http://127.0.0.1:11434/api/embed", "").await;
    let job_id = h.put("intro", "v1", 2).await;

    let before = kb_indexer::db::now_ms();
    let outcome = h.run_one().await;
    let JobOutcome::Retrying { attempts, retry_at } = outcome else {
        panic!("expected retry, got {:?}", outcome);
    };
    assert_eq!(attempts, 1);
    assert!(retry_at >= before + 10);

    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.as_deref().unwrap().contains("chunk 1 of 2"));

    h.make_due(&job_id).await;
    assert!(matches!(
        h.run_one().await,
        JobOutcome::Retrying { attempts: 2, .. }
    ));

    h.make_due(&job_id).await;
    let outcome = h.run_one().await;
    let JobOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("giving up after 3 attempts"), "{}", error);

    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(embedder.calls(), 3, "the first chunk fails each time");

    let revisions = revision::list_revisions(&h.pool, WS, "intro").await.unwrap();
    assert_eq!(revisions.len(), 3);
    assert!(revisions.iter().all(|r| r.status == RevisionStatus::Failed));
    assert!(worker::poll_once(&h.ctx).await.unwrap().is_none());
}

#[tokio::test]
async fn usage_guard_denial_fails_job_before_embedding() {
    let embedder = ScriptedEmbedder::ok();
    let h = Harness::with(
        embedder.clone(),
        "http://127.0.0.1:11434/api/embed",
        "\n[usage]\nenabled = true\nmax_chunks_per_document = 2\n",
    )
    .await;
    h.put("intro", "v1", 3).await;

    let outcome = h.run_one().await;
    let JobOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("chunk_budget_exceeded"), "{}", error);
    assert_eq!(embedder.calls(), 0);
    assert_eq!(h.points_of_document("intro"), 0);
}

// ─── Concurrency and action control ─────────────────────────────────

#[tokio::test]
async fn locked_document_defers_job_without_counting_an_attempt() {
    let h = Harness::new().await;
    let held = h.ctx.lock.acquire(WS, "intro").await.unwrap().unwrap();
    let job_id = h.put("intro", "v1", 2).await;

    let outcome = h.run_one().await;
    let JobOutcome::LockBusy { retry_at } = outcome else {
        panic!("expected lock busy, got {:?}", outcome);
    };
    assert!(!outcome.handled());

    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.scheduled_at, retry_at);
    assert!(revision::list_revisions(&h.pool, WS, "intro")
        .await
        .unwrap()
        .is_empty());

    // Not due yet
    assert!(worker::poll_once(&h.ctx).await.unwrap().is_none());

    h.ctx.lock.release(&held).await.unwrap();
    h.make_due(&job_id).await;
    completed_revision(&h.run_one().await);
}

#[tokio::test]
async fn concurrent_jobs_for_one_document_have_a_single_writer() {
    let embedder = ScriptedEmbedder::slow(Duration::from_millis(100));
    let h = Harness::with(embedder.clone(), "http://127.0.0.1:11434/api/embed", "").await;

    let first_id = h.put("intro", "v1", 2).await;
    let first = queue::claim_next_job(&h.pool).await.unwrap().unwrap();
    assert_eq!(first.id, first_id);
    let second_id = h.put("intro", "v2", 2).await;
    assert_ne!(first_id, second_id);
    let second = queue::claim_next_job(&h.pool).await.unwrap().unwrap();
    assert_eq!(second.id, second_id);

    let (a, b) = tokio::join!(process_job(&h.ctx, &first), process_job(&h.ctx, &second));
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, JobOutcome::Completed { .. }))
        .count();
    let busy = outcomes
        .iter()
        .filter(|o| matches!(o, JobOutcome::LockBusy { .. }))
        .count();
    assert_eq!((completed, busy), (1, 1), "{:?}", outcomes);

    // The deferred job never opened a revision
    let revisions = revision::list_revisions(&h.pool, WS, "intro").await.unwrap();
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].status, RevisionStatus::Ready);
    assert_eq!(embedder.calls(), 2);
    assert_eq!(h.points_of_document("intro"), 2);

    let loser = if matches!(outcomes[0], JobOutcome::LockBusy { .. }) {
        &first_id
    } else {
        &second_id
    };
    let job = queue::get_job(&h.pool, loser).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn paused_action_defers_and_canceled_action_fails_jobs() {
    let embedder = ScriptedEmbedder::ok();
    let h = Harness::with(embedder.clone(), "http://127.0.0.1:11434/api/embed", "").await;
    let cfg = h.ctx.config.actions.clone();
    let started = action::start_action(&h.pool, &cfg, WS, BASE, RunConfig::default())
        .await
        .unwrap();
    let job_id = h.put("intro", "v1", 2).await;

    action::pause_action(&h.pool, &cfg, &started.action_id)
        .await
        .unwrap();
    let outcome = h.run_one().await;
    assert!(matches!(outcome, JobOutcome::Paused { .. }), "{:?}", outcome);
    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    action::cancel_action(&h.pool, &cfg, &started.action_id)
        .await
        .unwrap();
    h.make_due(&job_id).await;
    let outcome = h.run_one().await;
    let JobOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("canceled"), "{}", error);
    assert_eq!(embedder.calls(), 0);

    let action = action::get_action(&h.pool, &started.action_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.status, ActionStatus::Canceled);
    assert!(action
        .payload
        .events
        .iter()
        .any(|e| e.level == "error" && e.document_id.as_deref() == Some("intro")));

    let doc = documents::get_document(&h.pool, WS, "intro").await.unwrap().unwrap();
    assert_eq!(doc.index_status, documents::STATUS_ERROR);
    assert!(doc.index_error.unwrap_or_default().contains("canceled"));
    let job = queue::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn action_finishes_done_when_all_jobs_complete() {
    let h = Harness::new().await;
    let cfg = h.ctx.config.actions.clone();
    let run = RunConfig {
        chunk_size: Some(1_000),
        ..Default::default()
    };
    let started = action::start_action(&h.pool, &cfg, WS, BASE, run).await.unwrap();
    h.put("intro", "v1", 3).await;
    h.put("faq", "v1", 2).await;

    // The action's chunk size merges the paragraphs into one chunk each
    for _ in 0..2 {
        let outcome = h.run_one().await;
        assert!(matches!(outcome, JobOutcome::Completed { chunk_count: 1, .. }), "{:?}", outcome);
    }

    let action = action::get_action(&h.pool, &started.action_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.status, ActionStatus::Done);
    assert_eq!(action.payload.total_documents, 2);
    assert_eq!(action.payload.processed_documents, 2);
    assert_eq!(action.payload.progress_percent, 100);
    assert_eq!(action.payload.failed_documents, 0);
}

#[tokio::test]
async fn worker_drains_queue_and_stops_on_request() {
    let h = Harness::new().await;
    h.put("intro", "v1", 2).await;
    h.put("faq", "v1", 3).await;

    let handle = worker::start_worker(h.ctx.clone());
    let scope = queue::JobScope {
        workspace_id: Some(WS),
        base_id: Some(BASE),
        since: None,
    };
    let mut counts = queue::count_by_status(&h.pool, &scope).await.unwrap();
    for _ in 0..250 {
        if counts.completed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        counts = queue::count_by_status(&h.pool, &scope).await.unwrap();
    }
    handle.stop().await;

    assert_eq!(counts.completed, 2);
    assert_eq!(counts.active(), 0);
    assert_eq!(h.points_of_document("intro"), 2);
    assert_eq!(h.points_of_document("faq"), 3);
}
