pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod manifest;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod query;
pub mod retry;
pub mod stores;
pub mod tokenizer;
pub mod traits;

pub use chunking::{plan_windows, Chunker, ChunkingConfig};
pub use config::{EmbedderKind, PipelineConfig};
pub use embeddings::{
    Embedder, EmbeddingConfig, HashingEmbedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, IngestError, PipelineError, ServiceError};
pub use extractor::{document_metadata, LopdfExtractor, PdfExtractor};
pub use ingest::{digest_file, discover_pdf_files, document_id_for, Workspace};
pub use manifest::{Manifest, ManifestEntry, ManifestSummary, Stage, StageStatus};
pub use models::{
    chunk_id, Chunk, ChunkMetadata, DocumentMetadata, DocumentRecord, EmbeddingRecord,
    ExtractedDocument, IndexStats, MetadataFilter, NormalizedDocument, PageOffset, PageText,
    QueryMatch, QueryRequest,
};
pub use normalizer::{Normalizer, NormalizerConfig};
pub use orchestrator::{FailedDocument, Pipeline, RunSummary, SkippedDocument};
pub use query::QueryService;
pub use retry::{RateLimiter, RetryPolicy};
pub use stores::{PineconeStore, QdrantStore, VectorBackend, VectorStoreConfig};
pub use tokenizer::{Token, Tokenizer, WhitespaceTokenizer};
pub use traits::VectorStore;
