//! Embedding generation for the encode stage.
//!
//! The [`Embedder`] trait abstracts over embedding providers; the default
//! implementation calls the Ollama `/api/embed` endpoint. Encoding is an
//! optional stage: failures degrade the pipeline run, never fail it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Embedding generation interface.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or the request fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;
}

/// Errors from embedding generation.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// HTTP transport failure.
    #[error("embedder request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response did not match the expected format.
    #[error("embedder response parse error: {0}")]
    Parse(String),

    /// Provider is unavailable.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
}

/// Ollama-based embedder using `POST {base_url}/api/embed`.
pub struct OllamaEmbedder {
    model: String,
    base_url: String,
    dims: usize,
    client: reqwest::Client,
}

impl std::fmt::Debug for OllamaEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEmbedder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dims", &self.dims)
            .finish()
    }
}

impl OllamaEmbedder {
    /// Create an embedder for the given endpoint and model.
    ///
    /// `dims` is the expected dimensionality (e.g. 768 for
    /// nomic-embed-text), used by the vector store to size collections.
    pub fn new(base_url: &str, model: &str, dims: usize) -> Self {
        Self {
            model: model.to_owned(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            dims,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: self.model.clone(),
            input: text.to_owned(),
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EmbedError::Unavailable(format!(
                "embedding endpoint returned {status}: {body_text}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Parse(e.to_string()))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Parse("empty embeddings array".to_owned()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Request body for `/api/embed`.
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: String,
}

/// Response body from `/api/embed`.
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}
