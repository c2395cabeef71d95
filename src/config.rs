//! Configuration loading and validation.
//!
//! The service is configured via a JSON file (default: `config.json`,
//! overridable with `--config <path>`). Every section has a typed sub-struct
//! with `#[serde(default = "...")]` functions for optional fields, followed
//! by a post-load validation pass that rejects out-of-range values.
//!
//! `${VAR}` occurrences in string-typed leaves are substituted from the
//! process environment after parsing; an unset variable is left verbatim
//! with a warning logged, not treated as fatal.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenizerConfig {
    #[serde(default = "default_tokenizer_path")]
    pub config_path: String,
    #[serde(default = "default_max_input_chars_per_word")]
    pub max_input_chars_per_word: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            config_path: default_tokenizer_path(),
            max_input_chars_per_word: default_max_input_chars_per_word(),
        }
    }
}

fn default_tokenizer_path() -> String {
    "tokenizer.json".to_string()
}
fn default_max_input_chars_per_word() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub nof_min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub nof_max_tokens: usize,
    #[serde(default = "default_overlap_percentage")]
    pub overlap_percentage: f64,
    #[serde(default)]
    pub semantic: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            nof_min_tokens: default_min_tokens(),
            nof_max_tokens: default_max_tokens(),
            overlap_percentage: default_overlap_percentage(),
            semantic: false,
        }
    }
}

fn default_min_tokens() -> usize {
    50
}
fn default_max_tokens() -> usize {
    500
}
fn default_overlap_percentage() -> f64 {
    0.1
}

/// A single inference API entry (shared shape for embedding and generation lists).
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_format_placeholder")]
    pub query_format: String,
    #[serde(default = "default_format_placeholder")]
    pub document_format: String,
    #[serde(default = "default_max_tokens_name")]
    pub max_tokens_name: String,
    #[serde(default = "default_true")]
    pub temperature_support: bool,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub context_length: Option<usize>,
    #[serde(default)]
    pub pricing_tpm: Option<PricingConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cached_input: f64,
}

fn default_format_placeholder() -> String {
    "{}".to_string()
}
fn default_max_tokens_name() -> String {
    "max_tokens".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub current_api: String,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            current_api: String::new(),
            apis: Vec::new(),
            timeout_ms: default_embedding_timeout_ms(),
            batch_size: default_embedding_batch_size(),
            top_k: default_top_k(),
        }
    }
}

fn default_embedding_timeout_ms() -> u64 {
    10_000
}
fn default_embedding_batch_size() -> usize {
    16
}
fn default_top_k() -> usize {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        !self.current_api.is_empty()
    }

    pub fn current(&self) -> Option<&ApiConfig> {
        self.apis.iter().find(|a| a.id == self.current_api)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub current_api: String,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_full_sources")]
    pub max_full_sources: usize,
    #[serde(default = "default_max_related_per_source")]
    pub max_related_per_source: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_max_tokens_gen")]
    pub default_max_tokens: usize,
    #[serde(default = "default_label_format")]
    pub prepend_label_format: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            current_api: String::new(),
            apis: Vec::new(),
            timeout_ms: default_generation_timeout_ms(),
            max_full_sources: default_max_full_sources(),
            max_related_per_source: default_max_related_per_source(),
            max_context_tokens: default_max_context_tokens(),
            max_chunks: default_max_chunks(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens_gen(),
            prepend_label_format: default_label_format(),
        }
    }
}

fn default_generation_timeout_ms() -> u64 {
    20_000
}
fn default_max_full_sources() -> usize {
    2
}
fn default_max_related_per_source() -> usize {
    3
}
fn default_max_context_tokens() -> usize {
    20_000
}
fn default_max_chunks() -> usize {
    5
}
fn default_temperature() -> f64 {
    0.5
}
fn default_max_tokens_gen() -> usize {
    2048
}
fn default_label_format() -> String {
    "[{}]".to_string()
}

impl GenerationConfig {
    pub fn current(&self) -> Option<&ApiConfig> {
        self.apis.iter().find(|a| a.id == self.current_api)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_distance_metric")]
    pub distance_metric: DistanceMetric,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            index_path: default_index_path(),
            vector_dim: default_vector_dim(),
            max_elements: default_max_elements(),
            distance_metric: default_distance_metric(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("db.sqlite")
}
fn default_index_path() -> PathBuf {
    PathBuf::from("index")
}
fn default_vector_dim() -> usize {
    768
}
fn default_max_elements() -> usize {
    100_000
}
fn default_distance_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Directory,
    File,
    Url,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcePath {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub path: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default = "default_url_timeout_ms")]
    pub url_timeout_ms: u64,
}

fn default_url_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub global_exclude: Vec<String>,
    #[serde(default = "default_extensions")]
    pub default_extensions: Vec<String>,
    #[serde(default)]
    pub paths: Vec<SourcePath>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            encoding: default_encoding(),
            global_exclude: Vec::new(),
            default_extensions: default_extensions(),
            paths: Vec::new(),
        }
    }
}

fn default_max_file_size_mb() -> u64 {
    10
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_extensions() -> Vec<String> {
    vec![".txt".to_string(), ".md".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub logging_file: Option<String>,
    #[serde(default)]
    pub diagnostics_file: Option<String>,
}

/// Read, parse, env-substitute and validate the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let substituted = substitute_env(&content);

    let config: Config =
        serde_json::from_str(&substituted).with_context(|| "Failed to parse config file as JSON")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.nof_min_tokens == 0 {
        bail!("chunking.nof_min_tokens must be > 0");
    }
    if config.chunking.nof_max_tokens < config.chunking.nof_min_tokens {
        bail!("chunking.nof_max_tokens must be >= chunking.nof_min_tokens");
    }
    if !(0.0..1.0).contains(&config.chunking.overlap_percentage) {
        bail!("chunking.overlap_percentage must be in [0.0, 1.0)");
    }

    if config.embedding.is_enabled() && config.embedding.current().is_none() {
        bail!(
            "embedding.current_api '{}' not found in embedding.apis",
            config.embedding.current_api
        );
    }
    if !config.generation.current_api.is_empty() && config.generation.current().is_none() {
        bail!(
            "generation.current_api '{}' not found in generation.apis",
            config.generation.current_api
        );
    }

    if config.database.vector_dim == 0 {
        bail!("database.vector_dim must be > 0");
    }
    if config.database.max_elements == 0 {
        bail!("database.max_elements must be > 0");
    }

    if config.source.max_file_size_mb == 0 {
        bail!("source.max_file_size_mb must be > 0");
    }

    for p in &config.source.paths {
        if p.kind == SourceKind::Url && p.url.is_none() {
            bail!("source path of type 'url' must specify a 'url' field");
        }
    }

    Ok(())
}

/// Replace `${VAR}` occurrences with the corresponding environment variable,
/// leaving the token untouched (with a logged warning) when unset.
fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(dollar) = rest.find("${") {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[dollar..]);
            rest = "";
            break;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(val) => out.push_str(&val),
            Err(_) => {
                tracing::warn!(var = name, "config references unset environment variable");
                out.push_str(&rest[dollar..dollar + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_env_var() {
        std::env::set_var("RAGLINE_TEST_VAR", "secret123");
        let input = r#"{"api_key": "${RAGLINE_TEST_VAR}"}"#;
        let out = substitute_env(input);
        assert_eq!(out, r#"{"api_key": "secret123"}"#);
        std::env::remove_var("RAGLINE_TEST_VAR");
    }

    #[test]
    fn leaves_unset_var_verbatim() {
        std::env::remove_var("RAGLINE_DOES_NOT_EXIST");
        let input = r#"{"x": "${RAGLINE_DOES_NOT_EXIST}"}"#;
        let out = substitute_env(input);
        assert_eq!(out, input);
    }

    #[test]
    fn preserves_multibyte_characters_outside_placeholders() {
        std::env::set_var("RAGLINE_TEST_VAR_2", "x");
        let input = "{\"name\": \"caf\u{e9} \u{2603}\", \"key\": \"${RAGLINE_TEST_VAR_2}\"}";
        let out = substitute_env(input);
        assert!(out.contains('\u{e9}'));
        assert!(out.contains('\u{2603}'));
        assert!(out.ends_with("\"key\": \"x\"}"));
        std::env::remove_var("RAGLINE_TEST_VAR_2");
    }

    #[test]
    fn default_config_validates() {
        let config = Config {
            tokenizer: TokenizerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            database: DatabaseConfig::default(),
            source: SourceConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn rejects_inverted_token_bounds() {
        let mut config = Config {
            tokenizer: TokenizerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            database: DatabaseConfig::default(),
            source: SourceConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.chunking.nof_max_tokens = 1;
        config.chunking.nof_min_tokens = 50;
        assert!(validate(&config).is_err());
    }
}
