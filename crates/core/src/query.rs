use crate::embeddings::Embedder;
use crate::error::ServiceError;
use crate::models::{MetadataFilter, QueryMatch, QueryRequest};
use crate::retry::{RateLimiter, RetryPolicy};
use crate::traits::VectorStore;
use std::sync::Arc;
use tracing::debug;

/// Embeds query text and asks the vector store for the nearest chunks.
pub struct QueryService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    limiter: RateLimiter,
}

impl QueryService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        retry: RetryPolicy,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            embedder,
            store,
            retry,
            limiter,
        }
    }

    pub async fn search(
        &self,
        text: &str,
        top_k: usize,
        filter: MetadataFilter,
    ) -> Result<Vec<QueryMatch>, ServiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ServiceError::Request("query is empty".to_string()));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let embedder = &self.embedder;
        let store = &self.store;
        let limiter = &self.limiter;
        let query = [text.to_string()];
        let inputs = &query[..];

        let vector = self
            .retry
            .run("embed query", || async move {
                limiter.acquire().await;
                embedder.embed_batch(inputs).await
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Request("embedder returned no vector".to_string()))?;

        if vector.len() != embedder.dimensions() {
            return Err(ServiceError::DimensionMismatch {
                expected: embedder.dimensions(),
                actual: vector.len(),
            });
        }

        let request = QueryRequest {
            vector,
            top_k,
            filter,
        };
        let request = &request;
        let mut matches = self
            .retry
            .run("query", || async move {
                limiter.acquire().await;
                store.query(request).await
            })
            .await?;

        matches.sort_by(|left, right| right.score.total_cmp(&left.score));
        matches.truncate(top_k);
        debug!(top_k, returned = matches.len(), backend = store.backend(), "query finished");
        Ok(matches)
    }
}
