
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::{RagError, Result};

/// Top-level settings, loaded from `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub tokenizer: TokenizerConfig,
    pub chunking: ChunkingSettings,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub database: DatabaseConfig,
    pub files: FilesConfig,
    pub sources: Vec<SourceItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Path to a HuggingFace-style `tokenizer.json`. Empty means no
    /// vocabulary; the counter falls back to heuristic estimation.
    pub config_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingSettings {
    pub nof_min_tokens: usize,
    pub nof_max_tokens: usize,
    pub overlap_percentage: f32,
    pub semantic: bool,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            nof_min_tokens: 50,
            nof_max_tokens: 500,
            overlap_percentage: 0.1,
            semantic: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
    pub batch_size: usize,
    pub top_k: usize,
    pub prepend_phrase: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8583/embedding".to_string(),
            api_key: String::new(),
            model: String::new(),
            timeout_ms: 30_000,
            batch_size: 16,
            top_k: 5,
            prepend_phrase: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_full_sources: usize,
    pub max_related_per_source: usize,
    pub max_context_tokens: usize,
    pub max_chunks: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: String::new(),
            timeout_ms: 120_000,
            max_full_sources: 2,
            max_related_per_source: 2,
            max_context_tokens: 8192,
            max_chunks: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    #[default]
    #[serde(rename = "L2")]
    L2,
    #[serde(rename = "cosine")]
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
    pub index_path: String,
    pub vector_dim: usize,
    pub max_elements: usize,
    pub distance_metric: DistanceMetric,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "coderag.db".to_string(),
            index_path: "coderag.usearch".to_string(),
            vector_dim: 768,
            max_elements: 100_000,
            distance_metric: DistanceMetric::L2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    pub max_file_size_mb: u64,
    pub encoding: String,
    pub global_exclude: Vec<String>,
    pub default_extensions: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 10,
            encoding: "utf-8".to_string(),
            global_exclude: Vec::new(),
            default_extensions: Vec::new(),
        }
    }
}

/// One configured ingestion source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceItem {
    Directory {
        path: String,
        #[serde(default = "default_true")]
        recursive: bool,
        #[serde(default)]
        extensions: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    File {
        path: String,
    },
    Url {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_url_timeout")]
        timeout_ms: u64,
    },
}

fn default_true() -> bool {
    true
}

fn default_url_timeout() -> u64 {
    10_000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot open settings file: {0}")]
    FileNotFound(String),
    #[error("Malformed settings JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid vector dimension: {0} (must be between 1 and 8192)")]
    InvalidVectorDim(usize),
    #[error("Invalid overlap percentage: {0} (must be between 0.0 and 1.0)")]
    InvalidOverlap(f32),
    #[error("Invalid chunk bounds: min {0} must be below max {1}")]
    InvalidChunkBounds(usize, usize),
    #[error("Invalid batch size: {0} (must be at least 1)")]
    InvalidBatchSize(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for RagError {
    fn from(e: ConfigError) -> Self {
        RagError::Config(e.to_string())
    }
}

impl Settings {
    /// Load settings from `path`, probing the parent and grandparent
    /// directories before giving up.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let candidates = [
            path.to_path_buf(),
            PathBuf::from("..").join(path),
            PathBuf::from("../..").join(path),
        ];

        let found = candidates.iter().find(|p| p.is_file()).ok_or_else(|| {
            ConfigError::FileNotFound(path.display().to_string())
        })?;

        let content = fs::read_to_string(found).map_err(ConfigError::Io)?;
        let mut settings: Settings =
            serde_json::from_str(&content).map_err(ConfigError::Parse)?;

        settings.expand_env_vars();
        settings.validate()?;
        Ok(settings)
    }

    /// `${VAR}` substitution for api keys and URL-source header values.
    fn expand_env_vars(&mut self) {
        expand_var(&mut self.embedding.api_key);
        expand_var(&mut self.generation.api_key);
        for source in &mut self.sources {
            if let SourceItem::Url { headers, .. } = source {
                for value in headers.values_mut() {
                    expand_var(value);
                }
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for endpoint in [&self.embedding.api_url, &self.generation.api_url] {
            if !endpoint.is_empty() && Url::parse(endpoint).is_err() {
                return Err(ConfigError::InvalidUrl(endpoint.clone()));
            }
        }

        if !(1..=8192).contains(&self.database.vector_dim) {
            return Err(ConfigError::InvalidVectorDim(self.database.vector_dim));
        }

        let overlap = self.chunking.overlap_percentage;
        if !(0.0..=1.0).contains(&overlap) {
            return Err(ConfigError::InvalidOverlap(overlap));
        }

        if self.chunking.nof_min_tokens >= self.chunking.nof_max_tokens {
            return Err(ConfigError::InvalidChunkBounds(
                self.chunking.nof_min_tokens,
                self.chunking.nof_max_tokens,
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.embedding.batch_size));
        }

        Ok(())
    }
}

fn expand_var(value: &mut String) {
    if value.starts_with("${") && value.ends_with('}') {
        let name = &value[2..value.len() - 1];
        if let Ok(resolved) = std::env::var(name) {
            *value = resolved;
        }
    }
}
