use crate::{EmbeddingRecord, IndexStats, QueryMatch, QueryRequest, ServiceError};
use async_trait::async_trait;

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn describe(&self) -> Result<IndexStats, ServiceError>;

    /// Insert-or-update keyed by record id.
    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<(), ServiceError>;

    async fn delete(&self, ids: &[String]) -> Result<(), ServiceError>;

    /// Matches ordered by descending similarity score.
    async fn query(&self, request: &QueryRequest) -> Result<Vec<QueryMatch>, ServiceError>;
}
