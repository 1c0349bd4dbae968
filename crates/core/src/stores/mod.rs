pub mod pinecone;
pub mod qdrant;

pub use pinecone::PineconeStore;
pub use qdrant::QdrantStore;

use crate::error::{ConfigError, ServiceError};
use crate::traits::VectorStore;
use reqwest::Response;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Pinecone,
    Qdrant,
}

impl FromStr for VectorBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pinecone" => Ok(VectorBackend::Pinecone),
            "qdrant" => Ok(VectorBackend::Qdrant),
            other => Err(ConfigError::Invalid {
                name: "vector backend",
                details: format!("unknown backend {other:?}"),
            }),
        }
    }
}

impl fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorBackend::Pinecone => f.write_str("pinecone"),
            VectorBackend::Qdrant => f.write_str("qdrant"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub index_name: String,
    /// Data-plane URL. Pinecone resolves it from the index name when absent.
    pub host: Option<String>,
    pub api_key: Option<String>,
    pub namespace: Option<String>,
    pub cloud: String,
    pub region: String,
    pub timeout: Duration,
    pub upsert_batch_size: usize,
    pub metadata_text_chars: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Pinecone,
            index_name: "legal-index-v1".to_string(),
            host: None,
            api_key: None,
            namespace: None,
            cloud: "aws".to_string(),
            region: "us-east-1".to_string(),
            timeout: Duration::from_secs(30),
            upsert_batch_size: 100,
            metadata_text_chars: 8_000,
        }
    }
}

impl VectorStoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index_name.trim().is_empty() {
            return Err(ConfigError::Missing("vector index name"));
        }
        if self.upsert_batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "upsert batch size",
                details: "must be greater than zero".to_string(),
            });
        }
        if let Some(host) = &self.host {
            url::Url::parse(host).map_err(|error| ConfigError::Invalid {
                name: "vector store host",
                details: error.to_string(),
            })?;
        }
        if self.backend == VectorBackend::Pinecone
            && self.api_key.as_deref().map_or(true, |key| key.trim().is_empty())
        {
            return Err(ConfigError::Missing("PINECONE_API_KEY"));
        }
        Ok(())
    }
}

/// Builds the configured store, resolving Pinecone's index host when needed.
pub async fn connect(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>, ServiceError> {
    match config.backend {
        VectorBackend::Pinecone => Ok(Arc::new(PineconeStore::connect(config).await?)),
        VectorBackend::Qdrant => Ok(Arc::new(QdrantStore::new(config)?)),
    }
}

/// Creates the index or collection with cosine distance if it is missing.
pub async fn ensure_index(config: &VectorStoreConfig, dimension: usize) -> Result<(), ServiceError> {
    match config.backend {
        VectorBackend::Pinecone => PineconeStore::ensure_index(config, dimension).await,
        VectorBackend::Qdrant => QdrantStore::new(config)?.ensure_collection(dimension).await,
    }
}

pub(crate) async fn check_status(
    backend: &str,
    response: Response,
) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let details = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(ServiceError::BackendResponse {
        backend: backend.to_string(),
        status,
        details,
    })
}
