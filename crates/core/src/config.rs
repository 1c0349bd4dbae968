use crate::chunking::ChunkingConfig;
use crate::embeddings::{EmbeddingConfig, Embedder, HashingEmbedder, HttpEmbedder};
use crate::error::ConfigError;
use crate::normalizer::NormalizerConfig;
use crate::retry::{RateLimiter, RetryPolicy};
use crate::stores::VectorStoreConfig;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderKind {
    /// OpenAI-compatible `/embeddings` endpoint.
    #[default]
    Http,
    /// Offline trigram hashing, no credentials required.
    Hashing,
}

impl FromStr for EmbedderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" | "openai" => Ok(EmbedderKind::Http),
            "hashing" | "local" => Ok(EmbedderKind::Hashing),
            other => Err(ConfigError::Invalid {
                name: "embedder",
                details: format!("unknown embedder {other:?}"),
            }),
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedderKind::Http => f.write_str("http"),
            EmbedderKind::Hashing => f.write_str("hashing"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Defaults to `{data_dir}/raw`.
    pub input_dir: Option<PathBuf>,
    pub normalizer: NormalizerConfig,
    pub chunking: ChunkingConfig,
    pub embedder: EmbedderKind,
    pub embedding: EmbeddingConfig,
    pub store: VectorStoreConfig,
    pub retry: RetryPolicy,
    /// Shared by every embedding and vector store call; 0 disables limiting.
    pub requests_per_minute: u32,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            input_dir: None,
            normalizer: NormalizerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedder: EmbedderKind::default(),
            embedding: EmbeddingConfig::default(),
            store: VectorStoreConfig::default(),
            retry: RetryPolicy::default(),
            requests_per_minute: 0,
            workers: 1,
        }
    }
}

impl PipelineConfig {
    /// Everything that has to hold before any document is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking.validate()?;
        self.embedding.validate()?;
        self.store.validate()?;

        if !(0.0..=1.0).contains(&self.normalizer.repeat_fraction) {
            return Err(ConfigError::Invalid {
                name: "repeat_fraction",
                details: format!("{} is outside [0, 1]", self.normalizer.repeat_fraction),
            });
        }
        if self.embedder == EmbedderKind::Http
            && self
                .embedding
                .api_key
                .as_deref()
                .map_or(true, |key| key.trim().is_empty())
        {
            return Err(ConfigError::Missing("EMBEDDING_API_KEY"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "retry attempts",
                details: "must be at least one".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "workers",
                details: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn build_embedder(&self) -> Result<Arc<dyn Embedder>, ConfigError> {
        Ok(match self.embedder {
            EmbedderKind::Http => Arc::new(HttpEmbedder::new(&self.embedding)?),
            EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(self.embedding.dimensions)),
        })
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.requests_per_minute, self.requests_per_minute.min(10))
    }
}
