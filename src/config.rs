use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkParams;
use crate::encoding::{EncodingResolver, DEFAULT_ENCODINGS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where uploaded bytes are kept.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `"fs"` or `"s3"`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Root directory for the `fs` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root: default_storage_root(),
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            prefix: String::new(),
        }
    }
}

fn default_storage_backend() -> String {
    "fs".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared by consecutive windows.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> Result<ChunkParams> {
        Ok(ChunkParams::new(self.chunk_size, self.chunk_overlap)?)
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    /// Candidate encodings for plain-text files, tried in order.
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
    /// Upper bound on a single primary-parser call.
    #[serde(default = "default_parser_timeout_secs")]
    pub parser_timeout_secs: u64,
    /// Uploads larger than this are rejected.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Primary parser; absent means local parsing only.
    #[serde(default)]
    pub unstructured: Option<UnstructuredConfig>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            encodings: default_encodings(),
            parser_timeout_secs: default_parser_timeout_secs(),
            max_file_bytes: default_max_file_bytes(),
            unstructured: None,
        }
    }
}

impl ExtractConfig {
    pub fn parser_timeout(&self) -> Duration {
        Duration::from_secs(self.parser_timeout_secs)
    }

    pub fn resolver(&self) -> Result<EncodingResolver> {
        EncodingResolver::from_labels(&self.encodings)
    }
}

fn default_encodings() -> Vec<String> {
    DEFAULT_ENCODINGS.iter().map(|s| s.to_string()).collect()
}
fn default_parser_timeout_secs() -> u64 {
    60
}
fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnstructuredConfig {
    pub url: String,
    #[serde(default = "default_unstructured_strategy")]
    pub strategy: String,
    /// Environment variable holding the API key, if the service needs one.
    #[serde(default = "default_unstructured_key_env")]
    pub api_key_env: String,
}

fn default_unstructured_strategy() -> String {
    "fast".to_string()
}
fn default_unstructured_key_env() -> String {
    "UNSTRUCTURED_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
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
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates recalled from the vector store before reranking.
    #[serde(default = "default_initial_top_k")]
    pub initial_top_k: usize,
    /// Chunks returned to the caller.
    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            initial_top_k: default_initial_top_k(),
            final_top_k: default_final_top_k(),
        }
    }
}

fn default_initial_top_k() -> usize {
    50
}
fn default_final_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `"disabled"` or `"tei"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"disabled"`, `"openai"`, `"ollama"`, or `"openai-compatible"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents processed concurrently by batch ingestion.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    config.chunking.params()?;

    // Validate extraction
    config.extract.resolver()?;
    if config.extract.parser_timeout_secs == 0 {
        bail!("extract.parser_timeout_secs must be > 0");
    }
    if config.extract.max_file_bytes == 0 {
        bail!("extract.max_file_bytes must be > 0");
    }

    // Validate storage
    match config.storage.backend.as_str() {
        "fs" => {}
        "s3" => {
            if config.storage.bucket.is_none() {
                bail!("storage.bucket is required when backend is 's3'");
            }
        }
        other => bail!("Unknown storage backend: '{}'. Must be fs or s3.", other),
    }

    // Validate retrieval
    if config.retrieval.final_top_k < 1 {
        bail!("retrieval.final_top_k must be >= 1");
    }
    if config.retrieval.initial_top_k < config.retrieval.final_top_k {
        bail!("retrieval.initial_top_k must be >= retrieval.final_top_k");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "local" {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Validate reranker
    match config.reranker.provider.as_str() {
        "disabled" => {}
        "tei" => {
            if config.reranker.url.is_none() {
                bail!("reranker.url must be specified when provider is 'tei'");
            }
        }
        other => bail!(
            "Unknown reranker provider: '{}'. Must be disabled or tei.",
            other
        ),
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        "openai-compatible" => {
            if config.generation.url.is_none() {
                bail!("generation.url must be specified when provider is 'openai-compatible'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, ollama, or openai-compatible.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if !(config.generation.top_p > 0.0 && config.generation.top_p <= 1.0) {
        bail!("generation.top_p must be in (0.0, 1.0]");
    }

    if config.ingest.workers == 0 {
        bail!("ingest.workers must be >= 1");
    }

    Ok(config)
}
