//! Vector store client for task embeddings.
//!
//! The core only writes: the encode stage upserts one point per task.
//! Similarity queries are exposed for downstream consumers but unused by
//! the pipeline itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Vector store interface: upsert and query by embedding.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the point for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or rejects the point.
    async fn upsert(
        &self,
        task_id: &str,
        embedding: &[f32],
        metadata: serde_json::Value,
    ) -> Result<(), VectorError>;

    /// Return the ids of the `k` nearest points.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<String>, VectorError>;
}

/// Errors from vector store operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    /// HTTP transport failure.
    #[error("vector store request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response did not match the expected format.
    #[error("vector store response parse error: {0}")]
    Parse(String),

    /// Store rejected the operation.
    #[error("vector store rejected operation: {0}")]
    Rejected(String),
}

/// HTTP points-API client (`PUT /collections/{name}/points`,
/// `POST /collections/{name}/points/search`).
pub struct HttpVectorStore {
    base_url: String,
    collection: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVectorStore")
            .field("base_url", &self.base_url)
            .field("collection", &self.collection)
            .finish()
    }
}

impl HttpVectorStore {
    /// Create a client for the given endpoint and collection.
    pub fn new(base_url: &str, collection: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            collection: collection.to_owned(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(
        &self,
        task_id: &str,
        embedding: &[f32],
        metadata: serde_json::Value,
    ) -> Result<(), VectorError> {
        let url = format!("{}/collections/{}/points", self.base_url, self.collection);
        let body = json!({
            "points": [{
                "id": task_id,
                "vector": embedding,
                "payload": metadata,
            }]
        });

        let response = self.client.put(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(VectorError::Rejected(format!(
                "upsert returned {status}: {body_text}"
            )));
        }
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<String>, VectorError> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = json!({
            "vector": embedding,
            "limit": k,
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(VectorError::Rejected(format!(
                "search returned {status}: {body_text}"
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Parse(e.to_string()))?;
        Ok(parsed.result.into_iter().map(|hit| hit.id).collect())
    }
}

/// Response body from the points search endpoint.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<SearchHit>,
}

/// One search hit.
#[derive(Debug, Deserialize, Serialize)]
struct SearchHit {
    id: String,
}
