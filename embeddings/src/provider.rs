//! Embedding providers.
//!
//! A provider turns a batch of texts into one vector per text, in order.
//! [`encode_in_batches`] drives a provider over a whole corpus.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the model used by this provider.
    fn model(&self) -> &str;

    /// Encode a batch of texts, returning one embedding per text in input order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// Encode `texts` in consecutive batches of `batch_size`.
///
/// Every batch must come back with exactly one vector per text and every
/// vector must share the dimensionality of the first one. The first failing
/// batch aborts the whole call; nothing partial is returned.
pub async fn encode_in_batches<P>(
    provider: &P,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Embedding>>
where
    P: EmbeddingProvider + ?Sized,
{
    let batch_size = batch_size.max(1);
    let mut embeddings = Vec::with_capacity(texts.len());
    let mut dimension: Option<usize> = None;

    for (batch_no, batch) in texts.chunks(batch_size).enumerate() {
        let vectors = provider.encode(batch).await?;
        if vectors.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                actual: vectors.len(),
            });
        }

        for vector in &vectors {
            let expected = *dimension.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        debug!(
            provider = provider.name(),
            "Encoded batch {batch_no} ({} texts)",
            batch.len()
        );
        embeddings.extend(vectors);
    }

    Ok(embeddings)
}

/// Provider for any OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model name sent with every request.
    model: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            model: "text-embedding-3-small".to_string(),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Read the API key from the given environment variable, clearing it if unset.
    ///
    /// Self-hosted OpenAI-compatible servers usually need no key at all.
    pub fn with_api_key_env(mut self, var: &str) -> Self {
        self.api_key = std::env::var(var).ok();
        self
    }

    /// Send requests without an `Authorization` header.
    pub fn without_api_key(mut self) -> Self {
        self.api_key = None;
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating batch embeddings for {} texts with model: {}",
            texts.len(),
            self.model
        );

        let body = serde_json::json!({
            "input": texts,
            "model": self.model
        });

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        let mut result: OpenAIEmbeddingResponse = response.json().await?;

        // The API does not promise that rows come back in input order.
        result.data.sort_by_key(|item| item.index);
        if let Some((position, item)) = result
            .data
            .iter()
            .enumerate()
            .find(|(position, item)| item.index != *position)
        {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected embedding index {position}, found {}",
                item.index
            )));
        }

        let embeddings: Vec<Embedding> = result
            .data
            .into_iter()
            .map(|item| item.embedding)
            .collect();

        info!(
            "Generated {} batch embeddings with {}",
            embeddings.len(),
            result.model
        );

        Ok(embeddings)
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
