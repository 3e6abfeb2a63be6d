//! Embedding client: one text chunk in, one vector out.
//!
//! Request and response shapes differ per provider kind. Each
//! [`ProviderKind`] variant supplies the same capability pair,
//! [`ProviderKind::build_request`] and [`ProviderKind::extract_embedding`],
//! and [`HttpEmbeddingClient`] dispatches on the kind once per call:
//!
//! | Kind | Request | Vector found at |
//! |------|---------|-----------------|
//! | `openai` | `{"model", "input": "<text>", "dimensions"?}` | `data[0].embedding` |
//! | `gigachat` | `{"model", "input": ["<text>"]}` | `data[0].embedding` |
//! | `ollama` | `{"model", "input": "<text>"}` | `embeddings[0]` |
//!
//! No retries happen here: a transport failure surfaces as
//! [`EmbeddingError::Transport`] and the job queue decides whether the whole
//! job is retried.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{transport_message, EmbeddingError};

/// The result of embedding one text.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub usage_tokens: Option<u64>,
    pub embedding_id: Option<String>,
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(
        &self,
        provider: &ProviderConfig,
        access_token: Option<&str>,
        text: &str,
    ) -> Result<Embedding, EmbeddingError>;
}

impl ProviderKind {
    pub fn build_request(&self, model: &str, text: &str, dims: Option<usize>) -> Value {
        match self {
            ProviderKind::OpenAi => {
                let mut body = json!({ "model": model, "input": text });
                if let Some(dims) = dims {
                    body["dimensions"] = json!(dims);
                }
                body
            }
            ProviderKind::Gigachat => json!({ "model": model, "input": [text] }),
            ProviderKind::Ollama => json!({ "model": model, "input": text }),
        }
    }

    pub fn extract_embedding(&self, body: &Value) -> Result<Embedding, EmbeddingError> {
        match self {
            ProviderKind::OpenAi => {
                let item = first_data_item(body)?;
                Ok(Embedding {
                    vector: parse_vector(item.get("embedding"))?,
                    usage_tokens: body
                        .pointer("/usage/total_tokens")
                        .or_else(|| body.pointer("/usage/prompt_tokens"))
                        .and_then(Value::as_u64),
                    embedding_id: body.get("id").and_then(Value::as_str).map(str::to_string),
                })
            }
            ProviderKind::Gigachat => {
                let item = first_data_item(body)?;
                Ok(Embedding {
                    vector: parse_vector(item.get("embedding"))?,
                    usage_tokens: item
                        .pointer("/usage/prompt_tokens")
                        .and_then(Value::as_u64),
                    embedding_id: item
                        .get("index")
                        .and_then(Value::as_u64)
                        .map(|i| i.to_string()),
                })
            }
            ProviderKind::Ollama => {
                let first = body
                    .get("embeddings")
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                    .ok_or_else(|| {
                        EmbeddingError::InvalidResponseFormat("missing embeddings array".into())
                    })?;
                Ok(Embedding {
                    vector: parse_vector(Some(first))?,
                    usage_tokens: body.get("prompt_eval_count").and_then(Value::as_u64),
                    embedding_id: None,
                })
            }
        }
    }
}

fn first_data_item(body: &Value) -> Result<&Value, EmbeddingError> {
    body.get("data")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or_else(|| EmbeddingError::InvalidResponseFormat("missing data[0]".into()))
}

fn parse_vector(value: Option<&Value>) -> Result<Vec<f32>, EmbeddingError> {
    let array = value
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingError::InvalidResponseFormat("embedding is not an array".into()))?;

    let vector = array
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                EmbeddingError::InvalidResponseFormat(format!("non-numeric component: {}", v))
            })
        })
        .collect::<Result<Vec<f32>, _>>()?;

    if vector.is_empty() {
        return Err(EmbeddingError::EmptyVector);
    }
    Ok(vector)
}

/// Embedding client speaking HTTP to the provider's endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
}

impl HttpEmbeddingClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpEmbeddingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(
        &self,
        provider: &ProviderConfig,
        access_token: Option<&str>,
        text: &str,
    ) -> Result<Embedding, EmbeddingError> {
        let body = provider
            .kind
            .build_request(&provider.model, text, provider.dims);

        let mut request = self
            .client
            .post(&provider.url)
            .timeout(Duration::from_secs(provider.timeout_secs))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(token) = access_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| match transport_message(&e) {
            Some(msg) => EmbeddingError::Transport(msg),
            None => EmbeddingError::InvalidResponseFormat(e.to_string()),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponseFormat(e.to_string()))?;

        provider.kind.extract_embedding(&json)
    }
}
