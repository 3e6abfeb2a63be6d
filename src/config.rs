use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub knowledge_bases: HashMap<String, KnowledgeBaseConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_pause_recheck_ms")]
    pub pause_recheck_ms: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            pause_recheck_ms: default_pause_recheck_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    5_000
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_lock_retry_delay_ms() -> u64 {
    3_000
}
fn default_pause_recheck_ms() -> u64 {
    10_000
}
fn default_lock_ttl_secs() -> u64 {
    1_800
}
fn default_visibility_timeout_secs() -> u64 {
    1_800
}

/// Global indexing policy, the admin-configured defaults for every run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PolicyConfig {
    pub provider_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub schema_fields: Vec<SchemaField>,
}

fn default_chunk_size() -> usize {
    1_200
}
fn default_chunk_overlap() -> usize {
    200
}

/// One templated payload field. `template` is rendered with minijinja.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub template: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KnowledgeBaseConfig {
    #[serde(default)]
    pub schema_fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gigachat,
    Ollama,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub url: String,
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Static {
        api_key_env: String,
    },
    OAuth {
        token_url: String,
        credentials_env: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_collection_prefix() -> String {
    "kb".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ActionsConfig {
    #[serde(default = "default_action_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_failed_listed")]
    pub max_failed_listed: usize,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_action_timeout_secs(),
            max_events: default_max_events(),
            max_failed_listed: default_max_failed_listed(),
        }
    }
}

fn default_action_timeout_secs() -> u64 {
    3_600
}
fn default_max_events() -> usize {
    50
}
fn default_max_failed_listed() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UsageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_chunks_per_document: Option<usize>,
}

impl Config {
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Schema fields for a knowledge base: the per-base override when it
    /// declares any, otherwise the global policy fields.
    pub fn schema_fields_for(&self, base_id: &str) -> &[SchemaField] {
        match self.knowledge_bases.get(base_id) {
            Some(kb) if !kb.schema_fields.is_empty() => &kb.schema_fields,
            _ => &self.policy.schema_fields,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.policy.chunk_size == 0 {
        anyhow::bail!("policy.chunk_size must be > 0");
    }
    if config.policy.chunk_overlap >= config.policy.chunk_size {
        anyhow::bail!("policy.chunk_overlap must be smaller than policy.chunk_size");
    }
    if config.worker.max_attempts == 0 {
        anyhow::bail!("worker.max_attempts must be >= 1");
    }
    if config.worker.backoff_base_ms > config.worker.backoff_max_ms {
        anyhow::bail!("worker.backoff_base_ms must not exceed worker.backoff_max_ms");
    }
    // A job must not outlive its document lock before it counts as stale
    if config.worker.lock_ttl_secs < config.worker.visibility_timeout_secs {
        anyhow::bail!("worker.lock_ttl_secs must be >= worker.visibility_timeout_secs");
    }

    let mut seen = std::collections::HashSet::new();
    for provider in &config.providers {
        if !seen.insert(provider.id.as_str()) {
            anyhow::bail!("Duplicate provider id: '{}'", provider.id);
        }
        if provider.dims == Some(0) {
            anyhow::bail!("providers.{}.dims must be > 0", provider.id);
        }
    }

    for field in config
        .policy
        .schema_fields
        .iter()
        .chain(config.knowledge_bases.values().flat_map(|kb| kb.schema_fields.iter()))
    {
        if field.name.trim().is_empty() {
            anyhow::bail!("schema field names must not be empty");
        }
    }

    Ok(config)
}
