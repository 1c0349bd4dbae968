use super::{check_status, VectorStoreConfig};
use crate::traits::VectorStore;
use crate::{
    ChunkMetadata, EmbeddingRecord, IndexStats, MetadataFilter, QueryMatch, QueryRequest,
    ServiceError,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tracing::info;

const CONTROL_PLANE: &str = "https://api.pinecone.io";
const API_VERSION: &str = "2024-07";
const NAMESPACED_ENDPOINTS: &[&str] = &["vectors/upsert", "vectors/delete", "query"];

pub struct PineconeStore {
    client: Client,
    host: String,
    namespace: Option<String>,
}

impl PineconeStore {
    /// Uses `config.host` when set, otherwise looks the host up by index name.
    pub async fn connect(config: &VectorStoreConfig) -> Result<Self, ServiceError> {
        let client = build_client(config)?;
        let host = match &config.host {
            Some(host) => host.clone(),
            None => resolve_host(&client, &config.index_name).await?,
        };

        Ok(Self {
            client,
            host: normalize_host(&host),
            namespace: config.namespace.clone(),
        })
    }

    /// Creates a serverless cosine index unless one with this name exists.
    pub async fn ensure_index(config: &VectorStoreConfig, dimension: usize) -> Result<(), ServiceError> {
        let client = build_client(config)?;
        let response = client
            .get(format!("{CONTROL_PLANE}/indexes/{}", config.index_name))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            check_status("pinecone", response).await?;
            return Ok(());
        }

        info!(index = %config.index_name, dimension, region = %config.region, "creating pinecone index");
        let response = client
            .post(format!("{CONTROL_PLANE}/indexes"))
            .json(&json!({
                "name": config.index_name,
                "dimension": dimension,
                "metric": "cosine",
                "spec": {
                    "serverless": {
                        "cloud": config.cloud,
                        "region": config.region,
                    }
                }
            }))
            .send()
            .await?;
        check_status("pinecone", response).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.host, path)
    }

    /// Adds the namespace to bodies of endpoints that accept one.
    fn scoped_body(&self, path: &str, mut body: Value) -> Value {
        if !NAMESPACED_ENDPOINTS.contains(&path) {
            return body;
        }
        if let (Some(namespace), Some(object)) = (&self.namespace, body.as_object_mut()) {
            object.insert("namespace".to_string(), Value::String(namespace.clone()));
        }
        body
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ServiceError> {
        let response = self
            .client
            .post(self.url(path))
            .json(&self.scoped_body(path, body))
            .send()
            .await?;
        let response = check_status("pinecone", response).await?;
        Ok(response.json().await?)
    }
}

fn build_client(config: &VectorStoreConfig) -> Result<Client, ServiceError> {
    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ServiceError::Request("missing Pinecone API key".to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        "Api-Key",
        HeaderValue::from_str(api_key)
            .map_err(|error| ServiceError::Request(format!("invalid Pinecone API key: {error}")))?,
    );
    headers.insert("X-Pinecone-API-Version", HeaderValue::from_static(API_VERSION));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(Client::builder()
        .timeout(config.timeout)
        .default_headers(headers)
        .build()?)
}

async fn resolve_host(client: &Client, index_name: &str) -> Result<String, ServiceError> {
    let response = client
        .get(format!("{CONTROL_PLANE}/indexes/{index_name}"))
        .send()
        .await?;
    let description: Value = check_status("pinecone", response).await?.json().await?;
    description
        .pointer("/host")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Request(format!("index {index_name} has no host yet")))
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

fn filter_json(filter: &MetadataFilter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let conditions = filter
        .conditions()
        .into_iter()
        .map(|(field, value)| (field.to_string(), json!({ "$eq": value })))
        .collect::<Map<_, _>>();
    Some(Value::Object(conditions))
}

fn parse_matches(body: &Value) -> Vec<QueryMatch> {
    let mut matches = body
        .pointer("/matches")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|hit| QueryMatch {
            id: hit
                .pointer("/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
            metadata: hit
                .get("metadata")
                .cloned()
                .and_then(|metadata| serde_json::from_value::<ChunkMetadata>(metadata).ok()),
        })
        .collect::<Vec<_>>();

    matches.sort_by(|left, right| right.score.total_cmp(&left.score));
    matches
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn backend(&self) -> &'static str {
        "pinecone"
    }

    async fn describe(&self) -> Result<IndexStats, ServiceError> {
        let body = self.post("describe_index_stats", json!({})).await?;
        let dimension = body
            .pointer("/dimension")
            .and_then(Value::as_u64)
            .ok_or_else(|| ServiceError::Request("index stats missing dimension".to_string()))?;
        let total_vectors = body
            .pointer("/totalVectorCount")
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

        let vectors = records
            .iter()
            .map(|record| -> Result<Value, ServiceError> {
                Ok(json!({
                    "id": record.id,
                    "values": record.vector,
                    "metadata": serde_json::to_value(&record.metadata)?,
                }))
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        let body = self
            .post("vectors/upsert", json!({ "vectors": vectors }))
            .await?;
        let upserted = body
            .pointer("/upsertedCount")
            .and_then(Value::as_u64)
            .unwrap_or(records.len() as u64);
        if upserted != records.len() as u64 {
            return Err(ServiceError::Request(format!(
                "pinecone upserted {upserted} of {} vectors",
                records.len()
            )));
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), ServiceError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post("vectors/delete", json!({ "ids": ids })).await?;
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<QueryMatch>, ServiceError> {
        let mut body = json!({
            "vector": request.vector,
            "topK": request.top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let (Some(filter), Some(object)) = (filter_json(&request.filter), body.as_object_mut()) {
            object.insert("filter".to_string(), filter);
        }

        let response = self.post("query", body).await?;
        Ok(parse_matches(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_get_a_scheme() {
        assert_eq!(
            normalize_host("legal-index.svc.pinecone.io/"),
            "https://legal-index.svc.pinecone.io"
        );
        assert_eq!(normalize_host("http://localhost:5080"), "http://localhost:5080");
    }

    #[test]
    fn namespace_is_only_sent_to_data_endpoints() {
        let store = PineconeStore {
            client: Client::new(),
            host: "https://legal-index.svc.pinecone.io".to_string(),
            namespace: Some("judgments".to_string()),
        };

        assert_eq!(
            store.scoped_body("describe_index_stats", json!({})),
            json!({})
        );
        assert_eq!(
            store.scoped_body("query", json!({ "topK": 3 })),
            json!({ "topK": 3, "namespace": "judgments" })
        );
        assert_eq!(
            store.scoped_body("vectors/delete", json!({ "ids": ["a-0"] })),
            json!({ "ids": ["a-0"], "namespace": "judgments" })
        );
    }

    #[test]
    fn filters_become_eq_conditions() {
        let filter = MetadataFilter {
            document_id: Some("judgment-12".to_string()),
            source_file: None,
        };
        assert_eq!(
            filter_json(&filter),
            Some(json!({ "document_id": { "$eq": "judgment-12" } }))
        );
        assert_eq!(filter_json(&MetadataFilter::default()), None);
    }

    #[test]
    fn matches_are_sorted_by_descending_score() {
        let body = json!({
            "matches": [
                { "id": "a-0", "score": 0.2 },
                {
                    "id": "b-3",
                    "score": 0.9,
                    "metadata": {
                        "document_id": "b",
                        "source_file": "b.pdf",
                        "page_start": 2,
                        "page_end": 3,
                        "title": "B",
                        "sequence": 3,
                        "token_count": 600,
                        "text": "excerpt"
                    }
                }
            ]
        });

        let matches = parse_matches(&body);
        assert_eq!(matches[0].id, "b-3");
        assert_eq!(
            matches[0].metadata.as_ref().map(|metadata| metadata.page_end),
            Some(3)
        );
        assert!(matches[1].metadata.is_none());
    }
}
