//! Error taxonomy of the indexing pipeline.
//!
//! External-call boundaries (token service, embedding API, vector store)
//! have typed errors so the job orchestrator can classify a failure as
//! retryable or fatal without string matching. Everything else is carried
//! as `anyhow::Error` and treated as fatal.

use thiserror::Error;

/// Errors from the embedding HTTP call.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid embedding response format: {0}")]
    InvalidResponseFormat(String),

    #[error("embedding provider returned an empty vector")]
    EmptyVector,

    /// Connect failures and timeouts.
    #[error("embedding transport error: {0}")]
    Transport(String),
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from the vector store gateway.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("collection '{collection}' has vector size {actual}, expected {expected}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid vector store response: {0}")]
    InvalidResponse(String),

    #[error("vector store transport error: {0}")]
    Transport(String),
}

/// Errors from obtaining a provider access token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("credentials for provider '{provider}' are not available: {reason}")]
    MissingCredentials { provider: String, reason: String },

    #[error("token endpoint error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("token transport error: {0}")]
    Transport(String),
}

impl TokenError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Map a reqwest error into a transport message when it is network- or
/// timeout-flavored, or `None` otherwise.
pub(crate) fn transport_message(err: &reqwest::Error) -> Option<String> {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Some(err.to_string())
    } else {
        None
    }
}

/// Outcome classification of a failed job step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Network or timeout failure; the job is retried with backoff.
    #[error("{0}")]
    Retryable(String),

    /// Configuration, content, upload or internal failure; no retry.
    #[error("{0}")]
    Fatal(String),

    /// The owning action was canceled; no retry.
    #[error("canceled: {0}")]
    Canceled(String),
}

impl JobError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Classify an embedding failure for chunk `index` (1-based) of `total`.
    pub fn from_embedding(err: &EmbeddingError, index: usize, total: usize) -> Self {
        let message = format!("embedding failed for chunk {} of {}: {}", index, total, err);
        if err.is_retryable() {
            Self::Retryable(message)
        } else {
            Self::Fatal(message)
        }
    }

    pub fn from_token(err: &TokenError) -> Self {
        let message = format!("access token unavailable: {}", err);
        if err.is_retryable() {
            Self::Retryable(message)
        } else {
            Self::Fatal(message)
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Fatal(format!("{:#}", err))
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        Self::Fatal(format!("database error: {}", err))
    }
}
