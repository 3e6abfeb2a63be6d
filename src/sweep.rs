//! Out-of-band orphan sweep.
//!
//! A job that crashed after its upsert but before the switch leaves points
//! under a revision that never became current. The next successful run of
//! that document deletes them; `sweep_orphans` does the same for every
//! indexed document without waiting for one.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::documents;
use crate::pipeline::collection_name;
use crate::vector_store::{VectorFilter, VectorStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub documents: usize,
    pub deleted: u64,
    pub failures: usize,
}

pub async fn sweep_orphans(
    pool: &SqlitePool,
    config: &Config,
    store: &dyn VectorStore,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for doc in documents::list_indexed(pool).await? {
        let Some(current) = doc.current_revision_id.as_deref() else {
            continue;
        };
        report.documents += 1;

        let collection = collection_name(&config.vector_store.collection_prefix, &doc.workspace_id);
        let filter = VectorFilter::new()
            .must("workspace_id", &doc.workspace_id)
            .must("document_id", &doc.id)
            .must_not("revision_id", current);

        match store.delete_by_filter(&collection, &filter).await {
            Ok(n) => report.deleted += n,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(document_id = %doc.id, error = %e, "orphan sweep failed");
            }
        }
    }

    tracing::info!(
        documents = report.documents,
        deleted = report.deleted,
        failures = report.failures,
        "orphan sweep finished"
    );
    Ok(report)
}
