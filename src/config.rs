//! TOML configuration.
//!
//! Every section is optional; a missing file means "all defaults". The
//! default location is `./config/docchat.toml`, overridable with
//! `--config`.

use anyhow::{bail, Context, Result};
use docchat_core::chunk::{ChunkingOptions, LengthUnit};
use docchat_core::memory::MemoryMode;
use docchat_core::session::DEFAULT_CREDENTIAL_PATTERN;
use docchat_core::synthesis::{MapFailurePolicy, SynthesisOptions};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::loader::sitemap::request_interval;

pub const DEFAULT_CONFIG_PATH: &str = "./config/docchat.toml";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_doc_chunking")]
    pub chunking: ChunkingConfig,
    #[serde(default = "default_site_chunking")]
    pub site_chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sitemap: SitemapConfig,
    #[serde(default)]
    pub credential: CredentialConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunking: default_doc_chunking(),
            site_chunking: default_site_chunking(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            synthesis: SynthesisConfig::default(),
            memory: MemoryConfig::default(),
            cache: CacheConfig::default(),
            sitemap: SitemapConfig::default(),
            credential: CredentialConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default = "default_unit")]
    pub unit: LengthUnit,
}

impl ChunkingConfig {
    pub fn options(&self) -> ChunkingOptions {
        ChunkingOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            separator: self.separator.clone(),
            unit: self.unit,
        }
    }
}

fn default_unit() -> LengthUnit {
    LengthUnit::Tokens
}

fn default_doc_chunking() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size: 600,
        chunk_overlap: 100,
        separator: Some("\n".to_string()),
        unit: LengthUnit::Tokens,
    }
}

fn default_site_chunking() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size: 1000,
        chunk_overlap: 200,
        separator: None,
        unit: LengthUnit::Tokens,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: default_base_url(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
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
fn default_base_url() -> String {
    OPENAI_BASE_URL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
            base_url: default_base_url(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_map_concurrency")]
    pub map_concurrency: usize,
    #[serde(default)]
    pub map_failure: MapFailurePolicy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            map_concurrency: default_map_concurrency(),
            map_failure: MapFailurePolicy::default(),
        }
    }
}

impl SynthesisConfig {
    pub fn options(&self) -> SynthesisOptions {
        SynthesisOptions {
            map_concurrency: self.map_concurrency,
            map_failure: self.map_failure,
        }
    }
}

fn default_map_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_max_token_limit")]
    pub max_token_limit: usize,
    #[serde(default)]
    pub mode: MemoryMode,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_token_limit: default_max_token_limit(),
            mode: MemoryMode::default(),
        }
    }
}

fn default_max_token_limit() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Fs,
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            path: default_cache_path(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./.cache/embeddings")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SitemapConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default)]
    pub filter_urls: Vec<String>,
    /// 0 means no cap.
    #[serde(default)]
    pub max_pages: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SitemapConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            filter_urls: Vec::new(),
            max_pages: 0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_requests_per_second() -> f64 {
    5.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialConfig {
    #[serde(default = "default_credential_pattern")]
    pub pattern: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            pattern: default_credential_pattern(),
        }
    }
}

fn default_credential_pattern() -> String {
    DEFAULT_CREDENTIAL_PATTERN.to_string()
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Load `path` if given, else the default location if it exists, else the
/// built-in defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config(default)
            } else {
                let config = Config::default();
                validate(&config)?;
                Ok(config)
            }
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    for (name, chunking) in [
        ("chunking", &config.chunking),
        ("site_chunking", &config.site_chunking),
    ] {
        if chunking.chunk_size == 0 {
            bail!("{name}.chunk_size must be > 0");
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            bail!("{name}.chunk_overlap must be smaller than {name}.chunk_size");
        }
        if chunking.separator.as_deref() == Some("") {
            bail!("{name}.separator must not be empty");
        }
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai or disabled.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.trim().is_empty() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if config.llm.model.trim().is_empty() {
        bail!("llm.model must be specified");
    }

    if config.synthesis.map_concurrency == 0 {
        bail!("synthesis.map_concurrency must be >= 1");
    }

    if config.memory.max_token_limit == 0 {
        bail!("memory.max_token_limit must be > 0");
    }

    let rps = config.sitemap.requests_per_second;
    if !rps.is_finite() || rps <= 0.0 {
        bail!("sitemap.requests_per_second must be > 0");
    }
    if request_interval(rps).is_none() {
        bail!("sitemap.requests_per_second is too high: {}", rps);
    }
    for pattern in &config.sitemap.filter_urls {
        Regex::new(pattern)
            .with_context(|| format!("sitemap.filter_urls: invalid regex '{}'", pattern))?;
    }

    Regex::new(&config.credential.pattern)
        .with_context(|| "credential.pattern is not a valid regex")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chunking.chunk_size, 600);
        assert_eq!(config.chunking.separator.as_deref(), Some("\n"));
        assert_eq!(config.site_chunking.chunk_size, 1000);
        assert_eq!(config.site_chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.memory.max_token_limit, 1000);
        assert_eq!(config.cache.backend, CacheBackend::Fs);
        assert_eq!(config.sitemap.requests_per_second, 5.0);
        assert_eq!(config.synthesis.map_failure, MapFailurePolicy::Abort);
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse_config(
            r#"
            [chunking]
            chunk_size = 200
            chunk_overlap = 20
            unit = "chars"

            [synthesis]
            map_concurrency = 2
            map_failure = "skip"

            [memory]
            mode = "summary"

            [cache]
            backend = "sqlite"
            path = "/tmp/cache.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.unit, LengthUnit::Chars);
        assert_eq!(config.chunking.separator, None);
        assert_eq!(config.synthesis.map_failure, MapFailurePolicy::Skip);
        assert_eq!(config.memory.mode, MemoryMode::Summary);
        assert_eq!(config.cache.backend, CacheBackend::Sqlite);
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = parse_config(
            r#"
            [chunking]
            chunk_size = 100
            chunk_overlap = 100
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("chunking.chunk_overlap"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = parse_config("[embedding]\nprovider = \"ollama\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn bad_filter_regex_rejected() {
        let err = parse_config("[sitemap]\nfilter_urls = [\"(\"]\n").unwrap_err();
        assert!(format!("{err:#}").contains("sitemap.filter_urls"));
    }

    #[test]
    fn zero_rate_rejected() {
        assert!(parse_config("[sitemap]\nrequests_per_second = 0.0\n").is_err());
    }

    #[test]
    fn rate_without_request_gap_rejected() {
        let err = parse_config("[sitemap]\nrequests_per_second = 1e12\n").unwrap_err();
        assert!(err.to_string().contains("too high"), "{err}");
    }
}
