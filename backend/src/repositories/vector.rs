//! Vector index of embedded chat turns, scoped by session.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::UpstreamError;
use crate::types::SessionId;

const SERVICE: &str = "vector index";

/// An entry to insert or overwrite in the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub text: String,
    pub session_id: String,
}

/// A similarity match returned by a query, in service order.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub session_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Nearest `top_k` entries tagged with `session_id`.
    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        session_id: &SessionId,
    ) -> Result<Vec<VectorMatch>, UpstreamError>;

    async fn upsert(&self, record: VectorRecord) -> Result<(), UpstreamError>;
}

/// Client for a Pinecone serverless index data plane.
pub struct PineconeVectorStore {
    client: Client,
    index_host: String,
    api_key: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    metadata: Option<VectorMetadata>,
}

impl PineconeVectorStore {
    pub fn new(client: Client, index_host: impl Into<String>, api_key: impl Into<String>) -> Self {
        let index_host = index_host.into();
        let index_host = if index_host.starts_with("http://") || index_host.starts_with("https://")
        {
            index_host
        } else {
            format!("https://{}", index_host)
        };
        Self {
            client,
            index_host: index_host.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, UpstreamError> {
        let resp = self
            .client
            .post(format!("{}{}", self.index_host, path))
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::transport(SERVICE))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                service: SERVICE,
                status,
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl VectorStore for PineconeVectorStore {
    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        session_id: &SessionId,
    ) -> Result<Vec<VectorMatch>, UpstreamError> {
        let body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "filter": { "session_id": { "$eq": session_id.as_str() } },
        });
        let resp: QueryResponse = self
            .post("/query", body)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::payload(SERVICE, e.to_string()))?;

        Ok(resp
            .matches
            .into_iter()
            .filter_map(|m| {
                let metadata = m.metadata?;
                Some(VectorMatch {
                    id: m.id,
                    score: m.score,
                    text: metadata.text,
                    session_id: metadata.session_id,
                })
            })
            .collect())
    }

    async fn upsert(&self, record: VectorRecord) -> Result<(), UpstreamError> {
        self.post("/vectors/upsert", json!({ "vectors": [record] }))
            .await
            .map(|_| ())
    }
}
