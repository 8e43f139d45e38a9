//! Configuration parsing and validation.
//!
//! Inkwell RAG is configured via a TOML file. Every section has defaults, so
//! an empty file (or no file at all) yields a valid configuration.
//!
//! # Example
//!
//! ```toml
//! [project]
//! include_globs = ["**/*.md", "**/*.txt"]
//! exclude_globs = ["drafts/**"]
//!
//! [chunking]
//! max_tokens = 1500
//!
//! [retrieval]
//! keyword_weight = 0.4
//! semantic_weight = 0.6
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//! ```
//!
//! When no path is given, `<project>/.inkwell/rag.toml` is used if present.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use inkwell_rag_core::chunk::ChunkingParams;
use inkwell_rag_core::rank::{budget_for_context_window, RankWeights};

/// Config file looked up under the project root when none is given.
pub const DEFAULT_CONFIG_PATH: &str = ".inkwell/rag.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            min_tokens: self.min_tokens,
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

fn default_min_tokens() -> usize {
    50
}
fn default_max_tokens() -> usize {
    1500
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    /// Candidates requested from each search side before merging.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Upper bound on chunks returned, applied after the token budget.
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_reserve_percent")]
    pub reserve_percent: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: default_keyword_weight(),
            semantic_weight: default_semantic_weight(),
            candidate_k: default_candidate_k(),
            max_chunks: default_max_chunks(),
            context_window: default_context_window(),
            reserve_percent: default_reserve_percent(),
        }
    }
}

impl RetrievalConfig {
    pub fn weights(&self) -> RankWeights {
        RankWeights {
            keyword: self.keyword_weight,
            semantic: self.semantic_weight,
        }
    }

    /// Token budget derived from the context window and reserve share.
    pub fn default_budget(&self) -> usize {
        budget_for_context_window(self.context_window, self.reserve_percent)
    }
}

fn default_keyword_weight() -> f64 {
    0.4
}
fn default_semantic_weight() -> f64 {
    0.6
}
fn default_candidate_k() -> usize {
    40
}
fn default_max_chunks() -> usize {
    8
}
fn default_context_window() -> usize {
    4096
}
fn default_reserve_percent() -> f64 {
    0.70
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    600
}
fn default_max_entries() -> usize {
    64
}

/// Which embedding backend to talk to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    #[default]
    Disabled,
    Ollama,
    #[serde(rename = "openai")]
    OpenAI,
}

/// What a provider needs and can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub produces_vectors: bool,
    pub uses_network: bool,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: Option<&'static str>,
    pub default_url: Option<&'static str>,
}

impl EmbeddingProviderKind {
    pub fn capabilities(self) -> ProviderCapabilities {
        match self {
            EmbeddingProviderKind::Disabled => ProviderCapabilities {
                produces_vectors: false,
                uses_network: false,
                api_key_env: None,
                default_url: None,
            },
            EmbeddingProviderKind::Ollama => ProviderCapabilities {
                produces_vectors: true,
                uses_network: true,
                api_key_env: None,
                default_url: Some("http://localhost:11434"),
            },
            EmbeddingProviderKind::OpenAI => ProviderCapabilities {
                produces_vectors: true,
                uses_network: true,
                api_key_env: Some("OPENAI_API_KEY"),
                default_url: Some("https://api.openai.com"),
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingProviderKind::Disabled => "disabled",
            EmbeddingProviderKind::Ollama => "ollama",
            EmbeddingProviderKind::OpenAI => "openai",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL; falls back to the provider's default.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Disabled,
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider.capabilities().produces_vectors
    }

    pub fn base_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or(self.provider.capabilities().default_url)
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Check cross-field constraints. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.min_tokens > self.chunking.max_tokens {
            bail!(
                "chunking.min_tokens ({}) must be <= chunking.max_tokens ({})",
                self.chunking.min_tokens,
                self.chunking.max_tokens
            );
        }

        let r = &self.retrieval;
        for (name, w) in [
            ("keyword_weight", r.keyword_weight),
            ("semantic_weight", r.semantic_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                bail!("retrieval.{} must be in [0.0, 1.0]", name);
            }
        }
        if r.keyword_weight == 0.0 && r.semantic_weight == 0.0 {
            bail!("retrieval.keyword_weight and retrieval.semantic_weight cannot both be 0");
        }
        if r.candidate_k == 0 {
            bail!("retrieval.candidate_k must be >= 1");
        }
        if r.max_chunks == 0 {
            bail!("retrieval.max_chunks must be >= 1");
        }
        if !(r.reserve_percent > 0.0 && r.reserve_percent <= 1.0) {
            bail!("retrieval.reserve_percent must be in (0.0, 1.0]");
        }

        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be > 0");
        }

        let e = &self.embedding;
        if e.is_enabled() {
            if e.dims.is_none() || e.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    e.provider.as_str()
                );
            }
            if e.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider.as_str()
                );
            }
            if e.batch_size == 0 {
                bail!("embedding.batch_size must be >= 1");
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate TOML config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load the explicit config, else `<project_root>/.inkwell/rag.toml`, else defaults.
pub fn resolve_config(project_root: &Path, explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let default_path = project_root.join(DEFAULT_CONFIG_PATH);
    if default_path.is_file() {
        tracing::debug!(path = %default_path.display(), "using project config");
        return load_config(&default_path);
    }
    Ok(Config::default())
}
