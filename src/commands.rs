//! CLI command implementations for `kbx`.
//!
//! Each `run_*` function opens its own pool, does one thing and prints the
//! result to stdout.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::action;
use crate::config::Config;
use crate::db;
use crate::documents;
use crate::models::{IndexingAction, JobStatus, RunConfig};
use crate::pipeline::PipelineContext;
use crate::queue::{self, JobScope};
use crate::revision;
use crate::sweep;
use crate::vector_store::QdrantStore;
use crate::worker;

/// Store a document body (from a file) under a new version and queue it.
pub async fn run_doc_put(
    config: &Config,
    workspace_id: &str,
    base_id: &str,
    document_id: &str,
    file: &Path,
    version_id: Option<String>,
) -> Result<()> {
    let body = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let version_id = version_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let pool = db::connect(config).await?;
    documents::put_document(&pool, workspace_id, base_id, document_id, &version_id, &body).await?;
    let job = queue::enqueue_indexing_job(&pool, workspace_id, base_id, document_id, &version_id)
        .await?;
    pool.close().await;

    println!("Stored {} (version {})", document_id, version_id);
    println!("Queued job {}", job.id);
    Ok(())
}

pub async fn run_enqueue(
    config: &Config,
    workspace_id: &str,
    base_id: &str,
    document_id: &str,
    version_id: Option<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let version_id = match version_id {
        Some(v) => v,
        None => {
            documents::get_document(&pool, workspace_id, document_id)
                .await?
                .with_context(|| format!("document not found: {}", document_id))?
                .version_id
        }
    };
    let job =
        queue::enqueue_indexing_job(&pool, workspace_id, base_id, document_id, &version_id).await?;
    pool.close().await;

    println!("Queued job {} for {} (version {})", job.id, document_id, version_id);
    Ok(())
}

/// Run the worker until Ctrl-C, or until the queue is empty with `once`.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let ctx = PipelineContext::new(pool.clone(), config.clone());

    if once {
        let mut handled = 0;
        while let Some(outcome) = worker::poll_once(&ctx).await? {
            handled += 1;
            println!("  {:?}", outcome);
            if !outcome.handled() {
                break;
            }
        }
        println!("Processed {} job(s).", handled);
    } else {
        let handle = worker::start_worker(ctx);
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        println!("Stopping worker...");
        handle.stop().await;
    }

    pool.close().await;
    Ok(())
}

pub async fn run_jobs(
    config: &Config,
    workspace_id: Option<&str>,
    base_id: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> Result<()> {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let scope = JobScope {
        workspace_id,
        base_id,
        since: None,
    };

    let pool = db::connect(config).await?;
    let counts = queue::count_by_status(&pool, &scope).await?;
    let jobs = queue::list_jobs(&pool, &scope, status, limit).await?;
    pool.close().await;

    println!("Indexing jobs");
    println!("=============");
    println!();
    println!("  Pending:     {}", counts.pending);
    println!("  Processing:  {}", counts.processing);
    println!("  Completed:   {}", counts.completed);
    println!("  Failed:      {}", counts.failed);

    if !jobs.is_empty() {
        println!();
        println!(
            "  {:<36} {:<24} {:<10} {:>3}   {}",
            "JOB", "DOCUMENT", "STATUS", "TRY", "SCHEDULED"
        );
        println!("  {}", "-".repeat(96));
        for job in &jobs {
            println!(
                "  {:<36} {:<24} {:<10} {:>3}   {}",
                job.id,
                job.document_id,
                job.status,
                job.attempts,
                format_ts_relative(job.scheduled_at)
            );
            if let Some(err) = &job.last_error {
                println!("  {:<36} {}", "", err);
            }
        }
    }
    println!();
    Ok(())
}

/// Start an action; with `reindex`, queue every document of the base.
pub async fn run_action_start(
    config: &Config,
    workspace_id: &str,
    base_id: &str,
    run_config: RunConfig,
    reindex: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let created =
        action::start_action(&pool, &config.actions, workspace_id, base_id, run_config).await?;

    let mut queued = 0;
    if reindex {
        for doc in documents::list_documents(&pool, workspace_id, base_id).await? {
            queue::enqueue_indexing_job(&pool, workspace_id, base_id, &doc.id, &doc.version_id)
                .await?;
            queued += 1;
        }
    }
    pool.close().await;

    println!("Started action {}", created.action_id);
    if reindex {
        println!("Queued {} document(s)", queued);
    }
    Ok(())
}

pub async fn run_action_show(config: &Config, workspace_id: &str, base_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let latest = action::update_progress(&pool, &config.actions, workspace_id, base_id).await?;
    pool.close().await;

    match latest {
        Some(a) => print_action(&a),
        None => println!("No indexing action for {}/{}", workspace_id, base_id),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum ActionControl {
    Pause,
    Resume,
    Cancel,
}

pub async fn run_action_control(
    config: &Config,
    action_id: &str,
    control: ActionControl,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let updated = match control {
        ActionControl::Pause => action::pause_action(&pool, &config.actions, action_id).await,
        ActionControl::Resume => action::resume_action(&pool, &config.actions, action_id).await,
        ActionControl::Cancel => action::cancel_action(&pool, &config.actions, action_id).await,
    };
    pool.close().await;

    print_action(&updated?);
    Ok(())
}

pub async fn run_sweep(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = QdrantStore::new(&config.vector_store);
    let report = sweep::sweep_orphans(&pool, config, &store).await?;
    pool.close().await;

    println!(
        "Swept {} document(s): {} orphaned point(s) deleted, {} failure(s).",
        report.documents, report.deleted, report.failures
    );
    Ok(())
}

pub async fn run_revision_show(
    config: &Config,
    workspace_id: &str,
    document_id: &str,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let Some(doc) = documents::get_document(&pool, workspace_id, document_id).await? else {
        pool.close().await;
        bail!("document not found: {}", document_id);
    };
    let revisions = revision::list_revisions(&pool, workspace_id, document_id).await?;
    pool.close().await;

    println!("Document:  {}", doc.id);
    println!("Version:   {}", doc.version_id);
    println!(
        "Indexed:   {} ({})",
        doc.indexed_version_id.as_deref().unwrap_or("-"),
        doc.index_status
    );
    if let Some(err) = &doc.index_error {
        println!("Error:     {}", err);
    }
    println!();
    println!(
        "  {:<2} {:<36} {:<10} {:>6} {:>8}   {}",
        "", "REVISION", "STATUS", "CHUNKS", "TOKENS", "STARTED"
    );
    println!("  {}", "-".repeat(84));
    for rev in &revisions {
        let marker = if doc.current_revision_id.as_deref() == Some(rev.id.as_str()) {
            "*"
        } else {
            ""
        };
        println!(
            "  {:<2} {:<36} {:<10} {:>6} {:>8}   {}",
            marker,
            rev.id,
            rev.status,
            rev.chunk_count,
            rev.total_tokens,
            format_ts_relative(rev.started_at)
        );
        if let Some(err) = &rev.error {
            println!("  {:<2} {}", "", err);
        }
    }
    Ok(())
}

fn print_action(a: &IndexingAction) {
    println!("Action:    {}", a.action_id);
    println!("Status:    {} ({})", a.status, a.stage);
    println!("Progress:  {}", a.display_text);
    println!(
        "Documents: {} / {} processed, {} failed ({}%)",
        a.payload.processed_documents,
        a.payload.total_documents,
        a.payload.failed_documents,
        a.payload.progress_percent
    );
    if !a.payload.failed.is_empty() {
        println!();
        println!("  Failed documents:");
        for f in &a.payload.failed {
            println!("    {}: {}", f.document_id, f.error);
        }
    }
    if !a.payload.events.is_empty() {
        println!();
        println!("  Events:");
        for e in &a.payload.events {
            println!("    {} [{}] {}", format_ts_relative(e.at), e.level, e.message);
        }
    }
}

/// Format an epoch-millis timestamp relative to now (e.g. "3 mins ago").
fn format_ts_relative(ts_ms: i64) -> String {
    let delta = (chrono::Utc::now().timestamp_millis() - ts_ms) / 1_000;

    if delta < 0 {
        let ahead = -delta;
        return if ahead < 60 {
            format!("in {}s", ahead)
        } else {
            format!("in {} min", ahead / 60)
        };
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        chrono::DateTime::from_timestamp_millis(ts_ms)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts_ms.to_string())
    }
}
