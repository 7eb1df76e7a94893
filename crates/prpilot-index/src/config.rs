//! TOML configuration with `PRPILOT_*` environment overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::callgraph::ResolutionPolicy;
use crate::chunker::{ChunkerConfig, DEFAULT_TEXT_CHUNK_MAX_CHARS};
use crate::error::{IndexError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// External call-graph analyzer emitting DOT for one language.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExternalToolConfig {
    pub language: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds before the analyzer is killed and the file gets no edges.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,
    /// Extensions skipped in addition to the built-in binary set.
    #[serde(default)]
    pub skip_extensions: Vec<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_text_chunk_max_chars")]
    pub text_chunk_max_chars: usize,
    #[serde(default = "default_max_embed_tokens")]
    pub max_embed_tokens: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default)]
    pub resolution_policy: ResolutionPolicy,
    #[serde(default)]
    pub external_tools: Vec<ExternalToolConfig>,
    #[serde(default = "default_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_ignore_dirs() -> Vec<String> {
    [
        ".git",
        "__pycache__",
        "node_modules",
        "dist",
        "build",
        "venv",
        ".venv",
        "target",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}

fn default_text_chunk_max_chars() -> usize {
    DEFAULT_TEXT_CHUNK_MAX_CHARS
}

fn default_max_embed_tokens() -> usize {
    8191
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn default_embed_batch_size() -> usize {
    64
}

fn default_embed_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: default_ignore_dirs(),
            skip_extensions: Vec::new(),
            max_file_size: default_max_file_size(),
            text_chunk_max_chars: default_text_chunk_max_chars(),
            max_embed_tokens: default_max_embed_tokens(),
            workers: default_workers(),
            embed_batch_size: default_embed_batch_size(),
            embed_concurrency: default_embed_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            resolution_policy: ResolutionPolicy::default(),
            external_tools: Vec::new(),
            watch_debounce_ms: default_debounce_ms(),
        }
    }
}

impl IndexConfig {
    #[must_use]
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            text_chunk_max_chars: self.text_chunk_max_chars,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_chain_hops")]
    pub chain_hops: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_chain_hops() -> usize {
    3
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            chain_hops: default_chain_hops(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    /// Process-local vectors; pairs with an in-memory `SQLite` database.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default)]
    pub vector_backend: VectorBackend,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
}

fn default_sqlite_path() -> String {
    ".prpilot/index.db".into()
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            vector_backend: VectorBackend::default(),
            qdrant_url: default_qdrant_url(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting values are invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Self>(&content)
                .map_err(|e| IndexError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `IndexError::Config` naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.index.text_chunk_max_chars == 0, "index.text_chunk_max_chars"),
            (self.index.embed_batch_size == 0, "index.embed_batch_size"),
            (self.index.embed_concurrency == 0, "index.embed_concurrency"),
            (self.index.max_embed_tokens == 0, "index.max_embed_tokens"),
            (self.retrieval.top_k == 0, "retrieval.top_k"),
        ];
        if let Some((_, field)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(IndexError::Config(format!("{field} must be greater than zero")));
        }
        Ok(())
    }

    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PRPILOT_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("PRPILOT_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("PRPILOT_EMBEDDING_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            self.embedding.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("PRPILOT_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("PRPILOT_QDRANT_URL") {
            self.storage.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("PRPILOT_VECTOR_BACKEND") {
            if let Ok(backend) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.storage.vector_backend = backend;
            } else {
                tracing::warn!("ignoring invalid PRPILOT_VECTOR_BACKEND value: {v}");
            }
        }
        if let Ok(v) = std::env::var("PRPILOT_RESOLUTION_POLICY") {
            if let Ok(policy) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.index.resolution_policy = policy;
            } else {
                tracing::warn!("ignoring invalid PRPILOT_RESOLUTION_POLICY value: {v}");
            }
        }
        if let Ok(v) = std::env::var("PRPILOT_INDEX_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.workers = n;
        }
        if let Ok(v) = std::env::var("PRPILOT_INDEX_MAX_FILE_SIZE")
            && let Ok(n) = v.parse::<u64>()
        {
            self.index.max_file_size = n;
        }
        if let Ok(v) = std::env::var("PRPILOT_INDEX_EMBED_BATCH_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.embed_batch_size = n;
        }
        if let Ok(v) = std::env::var("PRPILOT_INDEX_EMBED_CONCURRENCY")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.embed_concurrency = n;
        }
        if let Ok(v) = std::env::var("PRPILOT_INDEX_MAX_EMBED_TOKENS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.max_embed_tokens = n;
        }
        if let Ok(v) = std::env::var("PRPILOT_RETRIEVAL_TOP_K")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.top_k = n;
        }
        if let Ok(v) = std::env::var("PRPILOT_RETRIEVAL_CHAIN_HOPS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.chain_hops = n;
        }
    }
}
