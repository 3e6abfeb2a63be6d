//! Indexing policy, provider registry and usage guard.
//!
//! The global policy comes from `[policy]` in the config file. An action may
//! carry a [`RunConfig`] that overrides parts of it for one run; the merge of
//! the two is the [`EffectivePolicy`] a job actually runs with, and its
//! SHA-256 ([`policy_hash`]) is stored on every revision for auditing.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::chunk::ChunkingOptions;
use crate::config::{Config, PolicyConfig, ProviderConfig, SchemaField, UsageConfig};
use crate::models::RunConfig;
use crate::token::TokenService;

/// The policy a job runs with after run-level overrides are applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePolicy {
    pub provider_id: String,
    pub model: Option<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub schema_fields: Vec<SchemaField>,
}

impl EffectivePolicy {
    pub fn chunking(&self) -> ChunkingOptions {
        ChunkingOptions {
            max_chars: self.chunk_size,
            overlap_chars: self.chunk_overlap,
        }
    }
}

/// Admin-configured defaults.
pub fn get_indexing_policy(config: &Config) -> &PolicyConfig {
    &config.policy
}

/// Merge the global policy, the knowledge base's schema and the run config.
pub fn effective_policy(config: &Config, base_id: &str, run: &RunConfig) -> Result<EffectivePolicy> {
    let global = get_indexing_policy(config);
    let policy = EffectivePolicy {
        provider_id: run
            .provider_id
            .clone()
            .unwrap_or_else(|| global.provider_id.clone()),
        model: run.model.clone().or_else(|| global.model.clone()),
        chunk_size: run.chunk_size.unwrap_or(global.chunk_size),
        chunk_overlap: run.chunk_overlap.unwrap_or(global.chunk_overlap),
        schema_fields: config.schema_fields_for(base_id).to_vec(),
    };

    if policy.chunk_size == 0 {
        bail!("chunk_size must be > 0");
    }
    if policy.chunk_overlap >= policy.chunk_size {
        bail!(
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            policy.chunk_overlap,
            policy.chunk_size
        );
    }
    Ok(policy)
}

/// Hex SHA-256 of the policy's JSON form.
pub fn policy_hash(policy: &EffectivePolicy) -> String {
    // Struct fields serialize in declaration order, so the JSON is stable.
    let json = serde_json::to_string(policy).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub is_configured: bool,
    pub status_reason: Option<String>,
}

impl ProviderStatus {
    fn ok() -> Self {
        Self {
            is_configured: true,
            status_reason: None,
        }
    }

    fn unconfigured(reason: impl Into<String>) -> Self {
        Self {
            is_configured: false,
            status_reason: Some(reason.into()),
        }
    }
}

/// Read-only view over the configured embedding providers.
pub struct ProviderRegistry<'a> {
    providers: &'a [ProviderConfig],
}

impl<'a> ProviderRegistry<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            providers: &config.providers,
        }
    }

    pub fn resolve_provider_status(&self, provider_id: &str) -> ProviderStatus {
        let Some(provider) = self.providers.iter().find(|p| p.id == provider_id) else {
            return ProviderStatus::unconfigured(format!("provider '{}' is not configured", provider_id));
        };
        if !provider.active {
            return ProviderStatus::unconfigured(format!("provider '{}' is inactive", provider_id));
        }
        if provider.url.trim().is_empty() {
            return ProviderStatus::unconfigured(format!("provider '{}' has no url", provider_id));
        }
        if provider.model.trim().is_empty() {
            return ProviderStatus::unconfigured(format!("provider '{}' has no model", provider_id));
        }
        match TokenService::credentials_available(provider) {
            Ok(()) => ProviderStatus::ok(),
            Err(e) => ProviderStatus::unconfigured(e.to_string()),
        }
    }

    /// Provider config with the policy's model override applied.
    pub fn get_provider(&self, provider_id: &str, model: Option<&str>) -> Option<ProviderConfig> {
        let mut provider = self.providers.iter().find(|p| p.id == provider_id)?.clone();
        if let Some(model) = model {
            provider.model = model.to_string();
        }
        Some(provider)
    }
}

/// What the pipeline is about to spend.
#[derive(Debug, Clone)]
pub struct UsageContext<'a> {
    pub workspace_id: &'a str,
    pub base_id: &'a str,
    pub document_id: &'a str,
    pub operation: &'a str,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason_code: Option<String>,
    pub message: Option<String>,
}

impl GuardDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason_code: None,
            message: None,
        }
    }

    pub fn deny(reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason_code: Some(reason_code.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Yes/no gate consulted before embedding.
#[async_trait]
pub trait UsageGuard: Send + Sync {
    async fn check(&self, ctx: &UsageContext<'_>) -> Result<GuardDecision>;
}

pub struct AllowAll;

#[async_trait]
impl UsageGuard for AllowAll {
    async fn check(&self, _ctx: &UsageContext<'_>) -> Result<GuardDecision> {
        Ok(GuardDecision::allow())
    }
}

/// Denies documents that would produce more than `max_chunks` embeddings.
pub struct ChunkBudgetGuard {
    pub max_chunks: usize,
}

#[async_trait]
impl UsageGuard for ChunkBudgetGuard {
    async fn check(&self, ctx: &UsageContext<'_>) -> Result<GuardDecision> {
        if ctx.chunk_count > self.max_chunks {
            return Ok(GuardDecision::deny(
                "chunk_budget_exceeded",
                format!(
                    "document {} needs {} embeddings, limit is {}",
                    ctx.document_id, ctx.chunk_count, self.max_chunks
                ),
            ));
        }
        Ok(GuardDecision::allow())
    }
}

pub fn guard_from_config(usage: &UsageConfig) -> Arc<dyn UsageGuard> {
    match usage.max_chunks_per_document {
        Some(max_chunks) if usage.enabled => Arc::new(ChunkBudgetGuard { max_chunks }),
        _ => Arc::new(AllowAll),
    }
}
