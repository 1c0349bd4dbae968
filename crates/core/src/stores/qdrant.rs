use super::{check_status, VectorStoreConfig};
use crate::traits::VectorStore;
use crate::{
    ChunkMetadata, EmbeddingRecord, IndexStats, MetadataFilter, QueryMatch, QueryRequest,
    ServiceError,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

const DEFAULT_ENDPOINT: &str = "http://localhost:6333";

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self, ServiceError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = config.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(api_key.trim()).map_err(|error| {
                    ServiceError::Request(format!("invalid Qdrant API key: {error}"))
                })?,
            );
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            endpoint: config
                .host
                .as_deref()
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            collection: config.index_name.clone(),
            client,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    /// Creates a cosine collection of `vector_size` unless it exists.
    pub async fn ensure_collection(&self, vector_size: usize) -> Result<(), ServiceError> {
        let response = self.client.get(self.collection_url()).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            check_status("qdrant", response).await?;
            return Ok(());
        }

        info!(collection = %self.collection, vector_size, "creating qdrant collection");
        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": { "size": vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;
        check_status("qdrant", response).await?;
        Ok(())
    }
}

/// Qdrant only accepts integer or UUID point ids.
pub fn point_id(record_id: &str) -> String {
    let digest = Sha256::digest(record_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

fn filter_json(filter: &MetadataFilter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let must = filter
        .conditions()
        .into_iter()
        .map(|(field, value)| json!({ "key": field, "match": { "value": value } }))
        .collect::<Vec<_>>();
    Some(json!({ "must": must }))
}

fn parse_hits(body: &Value) -> Vec<QueryMatch> {
    body.pointer("/result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|hit| {
            let payload = hit.get("payload").cloned();
            let id = payload
                .as_ref()
                .and_then(|payload| payload.get("record_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| match hit.get("id") {
                    Some(Value::String(id)) => id.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                });

            QueryMatch {
                id,
                score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
                metadata: payload
                    .and_then(|payload| serde_json::from_value::<ChunkMetadata>(payload).ok()),
            }
        })
        .collect()
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend(&self) -> &'static str {
        "qdrant"
    }

    async fn describe(&self) -> Result<IndexStats, ServiceError> {
        let response = self.client.get(self.collection_url()).send().await?;
        let body: Value = check_status("qdrant", response).await?.json().await?;

        let dimension = body
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ServiceError::Request("collection has no single unnamed vector config".to_string())
            })?;
        let total_vectors = body
            .pointer("/result/points_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(IndexStats {
            dimension: dimension as usize,
            total_vectors,
        })
    }

    async fn upsert(&self, records: &[EmbeddingRecord]) -> Result<(), ServiceError> {
        if records.is_empty() {
            return Ok(());
        }

        let points = records
            .iter()
            .map(|record| -> Result<Value, ServiceError> {
                let mut payload = serde_json::to_value(&record.metadata)?;
                if let Some(object) = payload.as_object_mut() {
                    object.insert("record_id".to_string(), Value::String(record.id.clone()));
                }
                Ok(json!({
                    "id": point_id(&record.id),
                    "vector": record.vector,
                    "payload": payload,
                }))
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status("qdrant", response).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), ServiceError> {
        if ids.is_empty() {
            return Ok(());
        }

        let points = ids.iter().map(|id| point_id(id)).collect::<Vec<_>>();
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status("qdrant", response).await?;
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<QueryMatch>, ServiceError> {
        let mut body = json!({
            "vector": request.vector,
            "limit": request.top_k,
            "with_payload": true,
        });
        if let (Some(filter), Some(object)) = (filter_json(&request.filter), body.as_object_mut()) {
            object.insert("filter".to_string(), filter);
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&body)
            .send()
            .await?;
        let parsed: Value = check_status("qdrant", response).await?.json().await?;

        let mut matches = parse_hits(&parsed);
        matches.sort_by(|left, right| right.score.total_cmp(&left.score));
        Ok(matches)
    }
}
