//! Core data models of the indexing pipeline.
//!
//! Jobs, actions, revisions, chunk sets and vector points, plus the status
//! enums of their state machines. Status values are stored as lowercase
//! strings in SQLite and converted with `as_str` / `FromStr`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        concat!("unknown ", stringify!($name), ": '{}'"),
                        other
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(JobStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// One unit of work: index one version of one document.
#[derive(Debug, Clone)]
pub struct IndexingJob {
    pub id: String,
    pub workspace_id: String,
    pub base_id: String,
    pub document_id: String,
    pub version_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Epoch millis before which the job is not eligible for claiming.
    pub scheduled_at: i64,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Processing,
    Paused,
    Canceled,
    Done,
    Error,
}

string_enum!(ActionStatus {
    Processing => "processing",
    Paused => "paused",
    Canceled => "canceled",
    Done => "done",
    Error => "error",
});

impl ActionStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Done | Self::Error)
    }
}

/// Per-run overrides of the global indexing policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_overlap: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub at: i64,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub document_id: String,
    pub error: String,
}

/// Structured progress of an action, stored as JSON in `payload_json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default)]
    pub total_documents: u64,
    #[serde(default)]
    pub processed_documents: u64,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub failed_documents: u64,
    #[serde(default)]
    pub failed: Vec<FailedDocument>,
    #[serde(default)]
    pub events: Vec<ActionEvent>,
    #[serde(default)]
    pub config: RunConfig,
}

/// One logical indexing run over a knowledge base.
#[derive(Debug, Clone)]
pub struct IndexingAction {
    pub action_id: String,
    pub workspace_id: String,
    pub base_id: String,
    pub status: ActionStatus,
    pub stage: String,
    pub display_text: String,
    pub payload: ActionPayload,
    pub created_at: i64,
    /// Start of the current `processing` stretch; reset on resume.
    pub processing_since: i64,
    pub updated_at: i64,
    /// Bumped on every write; writes are conditional on the value read.
    pub row_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Processing,
    Ready,
    Failed,
}

string_enum!(RevisionStatus {
    Processing => "processing",
    Ready => "ready",
    Failed => "failed",
});

/// One generation of indexed output for a document.
#[derive(Debug, Clone)]
pub struct DocumentIndexRevision {
    pub id: String,
    pub workspace_id: String,
    pub document_id: String,
    pub version_id: String,
    pub policy_hash: String,
    pub status: RevisionStatus,
    pub chunk_set_id: Option<String>,
    pub chunk_count: i64,
    pub total_tokens: i64,
    pub total_chars: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

/// A contiguous fragment of a document, the unit of embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_ordinal: i64,
    pub text: String,
    /// Char offsets into the document body, end exclusive.
    pub char_start: i64,
    pub char_end: i64,
    pub char_count: i64,
    pub token_count: i64,
    pub content_hash: String,
    pub vector_id: String,
}

#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub id: String,
    pub revision_id: String,
    pub document_id: String,
    pub chunks: Vec<Chunk>,
}

impl ChunkSet {
    pub fn total_chars(&self) -> i64 {
        self.chunks.iter().map(|c| c.char_count).sum()
    }

    pub fn total_tokens(&self) -> i64 {
        self.chunks.iter().map(|c| c.token_count).sum()
    }
}

/// Document content plus its index bookkeeping.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub workspace_id: String,
    pub base_id: String,
    pub body: String,
    pub version_id: String,
    pub current_revision_id: Option<String>,
    pub current_chunk_set_id: Option<String>,
    pub indexed_version_id: Option<String>,
    pub index_status: String,
    pub index_error: Option<String>,
    pub updated_at: i64,
}

/// The (id, vector, payload) triple written to the vector store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}
