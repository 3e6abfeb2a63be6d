//! Overlapping character-window chunker.
//!
//! Splits a document body into ordered [`Chunk`]s of at most `max_chars`
//! characters. Each window is cut at the best boundary found in its second
//! half (paragraph break, then line break, then space), and the next window
//! starts `overlap_chars` before the previous cut so neighbouring chunks
//! share context.
//!
//! Offsets are measured in chars (not bytes) into the original body, end
//! exclusive. Every chunk gets a fresh vector id, so chunk sets of two
//! revisions never collide in the vector store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::now_ms;
use crate::documents;
use crate::models::{Chunk, ChunkSet};

/// Approximate chars-per-token ratio used for token accounting.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

/// Produces the chunk set of one revision of a document.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk_document(
        &self,
        workspace_id: &str,
        document_id: &str,
        revision_id: &str,
        options: ChunkingOptions,
    ) -> Result<ChunkSet>;
}

/// Chunker that reads the document body from SQLite and persists the
/// resulting chunk set next to it.
pub struct SqliteChunker {
    pool: SqlitePool,
}

impl SqliteChunker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Chunker for SqliteChunker {
    async fn chunk_document(
        &self,
        workspace_id: &str,
        document_id: &str,
        revision_id: &str,
        options: ChunkingOptions,
    ) -> Result<ChunkSet> {
        let doc = documents::get_document(&self.pool, workspace_id, document_id)
            .await?
            .with_context(|| format!("document {} not found", document_id))?;

        let set = build_chunk_set(document_id, revision_id, &doc.body, options);
        persist_chunk_set(&self.pool, &set).await?;
        Ok(set)
    }
}

pub async fn persist_chunk_set(pool: &SqlitePool, set: &ChunkSet) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO chunk_sets (id, revision_id, document_id, chunk_count, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&set.id)
    .bind(&set.revision_id)
    .bind(&set.document_id)
    .bind(set.chunks.len() as i64)
    .bind(now_ms())
    .execute(&mut *tx)
    .await?;

    for chunk in &set.chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, chunk_set_id, document_id, chunk_ordinal, text,
                                char_start, char_end, char_count, token_count,
                                content_hash, vector_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&set.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_ordinal)
        .bind(&chunk.text)
        .bind(chunk.char_start)
        .bind(chunk.char_end)
        .bind(chunk.char_count)
        .bind(chunk.token_count)
        .bind(&chunk.content_hash)
        .bind(&chunk.vector_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Chunk `text` into a new [`ChunkSet`] owned by `revision_id`.
pub fn build_chunk_set(
    document_id: &str,
    revision_id: &str,
    text: &str,
    options: ChunkingOptions,
) -> ChunkSet {
    let chunks = split_text(text, options)
        .into_iter()
        .enumerate()
        .map(|(ordinal, span)| make_chunk(document_id, ordinal as i64, span))
        .collect();

    ChunkSet {
        id: Uuid::new_v4().to_string(),
        revision_id: revision_id.to_string(),
        document_id: document_id.to_string(),
        chunks,
    }
}

/// A trimmed window of the body, with char offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split text into overlapping windows. Whitespace-only input yields no
/// spans.
pub fn split_text(text: &str, options: ChunkingOptions) -> Vec<TextSpan> {
    let max_chars = options.max_chars.max(1);
    let overlap = options.overlap_chars.min(max_chars - 1);
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();

    let mut spans = Vec::new();
    let mut start = 0usize;

    while start < len {
        let hard_end = (start + max_chars).min(len);
        let end = if hard_end < len {
            find_boundary(&chars, start + max_chars / 2, hard_end).unwrap_or(hard_end)
        } else {
            hard_end
        };

        if let Some(span) = trimmed_span(&chars, start, end) {
            spans.push(span);
        }

        if end >= len {
            break;
        }

        // Step back by the overlap, but always make progress
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    spans
}

/// Best cut position in `(from, to]`: after a paragraph break, then after a
/// line break, then after a space.
fn find_boundary(chars: &[char], from: usize, to: usize) -> Option<usize> {
    let window = from.max(1)..to;

    let paragraph = window
        .clone()
        .rev()
        .find(|&i| chars[i] == '\n' && chars[i - 1] == '\n');
    if let Some(i) = paragraph {
        return Some(i + 1);
    }

    let line = window.clone().rev().find(|&i| chars[i] == '\n');
    if let Some(i) = line {
        return Some(i + 1);
    }

    window.rev().find(|&i| chars[i] == ' ').map(|i| i + 1)
}

fn trimmed_span(chars: &[char], start: usize, end: usize) -> Option<TextSpan> {
    let mut s = start;
    let mut e = end;
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    if s == e {
        return None;
    }
    Some(TextSpan {
        start: s,
        end: e,
        text: chars[s..e].iter().collect(),
    })
}

fn make_chunk(document_id: &str, ordinal: i64, span: TextSpan) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(span.text.as_bytes());
    let content_hash = hex::encode(hasher.finalize());
    let char_count = (span.end - span.start) as i64;

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_ordinal: ordinal,
        token_count: estimate_tokens(char_count as usize) as i64,
        char_start: span.start as i64,
        char_end: span.end as i64,
        char_count,
        content_hash,
        vector_id: Uuid::new_v4().to_string(),
        text: span.text,
    }
}

fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}
