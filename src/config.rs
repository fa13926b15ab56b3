use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root for stream files (`streams/`) and state indexes (`state/`).
    pub data_dir: PathBuf,
    /// SQLite file backing the graph store and vector store.
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Consecutive failed batches before a stage run is treated as a
    /// systemic outage and aborted.
    #[serde(default = "default_systemic_threshold")]
    pub systemic_failure_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            systemic_failure_threshold: default_systemic_threshold(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_systemic_threshold() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Glob patterns matched against files when an archive path is a
    /// directory.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum characters of message text folded into one chunk.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    2800
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_provider_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_provider_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    #[serde(default = "default_provider_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            max_tags: default_max_tags(),
            batch_size: default_provider_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "mock".to_string()
}
fn default_provider_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_tags() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    /// Cosine similarity a chunk must reach against a topic centroid to
    /// join that topic instead of opening a new one.
    #[serde(default = "default_assign_threshold")]
    pub assign_threshold: f32,
    /// Topics smaller than this are skipped at summarization.
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            assign_threshold: default_assign_threshold(),
            min_cluster_size: default_min_cluster_size(),
        }
    }
}

fn default_assign_threshold() -> f32 {
    0.6
}
fn default_min_cluster_size() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimilarityConfig {
    /// Minimum Jaccard overlap of topic sets for a SIMILAR_TO edge.
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f64,
    /// Structural-link batch size, bounding transaction size.
    #[serde(default = "default_link_batch_size")]
    pub link_batch_size: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: default_similarity_threshold(),
            link_batch_size: default_link_batch_size(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.25
}
fn default_link_batch_size() -> usize {
    250
}

impl Config {
    pub fn streams_dir(&self) -> PathBuf {
        self.storage.data_dir.join("streams")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.storage.data_dir.join("state")
    }

    /// A self-contained config rooted in the given directory, used by
    /// tests and scaffolding.
    pub fn minimal(root: &Path) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: root.join("data"),
                db_path: root.join("data").join("atlas.sqlite"),
            },
            pipeline: PipelineConfig::default(),
            ingest: IngestConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            clustering: ClusteringConfig::default(),
            similarity: SimilarityConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be > 0");
    }

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if !(0.0..=1.0).contains(&config.clustering.assign_threshold) {
        anyhow::bail!("clustering.assign_threshold must be in [0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.similarity.threshold) {
        anyhow::bail!("similarity.threshold must be in [0.0, 1.0]");
    }

    if config.similarity.link_batch_size == 0 {
        anyhow::bail!("similarity.link_batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "mock" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or mock.",
            other
        ),
    }

    if config.embedding.provider == "openai" {
        if config.embedding.model.is_none() {
            anyhow::bail!("embedding.model must be specified when provider is 'openai'");
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
        }
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" | "mock" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or mock.",
            other
        ),
    }

    if config.llm.provider == "openai" && config.llm.model.is_none() {
        anyhow::bail!("llm.model must be specified when provider is 'openai'");
    }

    Ok(config)
}
