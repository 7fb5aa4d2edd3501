use crate::cache::EmbeddingCache;
use crate::embeddings::Embedder;
use crate::error::{Result, RagchatError};
use crate::llm::{classify_provider_error, is_retryable};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI embeddings client for query text.
///
/// Retries 429/5xx with exponential backoff (quota exhaustion is never retried)
/// and keeps an optional LRU cache of recent query embeddings.
pub struct OpenAIEmbedder {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    dimensions: usize,
    max_retries: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAIEmbedder {
    pub fn new(
        api_base: impl Into<String>,
        api_key: String,
        model: String,
        dimensions: usize,
        cache: Option<Arc<EmbeddingCache>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RagchatError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model,
            dimensions,
            max_retries: 3,
            cache,
        })
    }

    async fn request_once(&self, text: &str) -> std::result::Result<Vec<f32>, (RagchatError, bool)> {
        // text-embedding-3 models accept a reduced dimension count; older ones reject the field.
        let dimensions = self.model.starts_with("text-embedding-3").then_some(self.dimensions);
        let request = EmbeddingRequest {
            model: &self.model,
            input: vec![text],
            dimensions,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| (RagchatError::Embedding(format!("Network error: {}", e)), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            let err = classify_provider_error(status, &body, "embeddings");
            let retry = is_retryable(status) && !matches!(err, RagchatError::QuotaExceeded(_));
            return Err((err, retry));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| (RagchatError::Embedding(format!("Failed to parse response: {}", e)), false))?;

        result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| (RagchatError::Embedding("Empty response from embeddings API".to_string()), false))
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&self.model, text) {
                log::debug!("Embedding cache hit");
                return Ok(cached);
            }
        }

        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        let embedding = loop {
            match self.request_once(text).await {
                Ok(embedding) => break embedding,
                Err((e, true)) if attempt < self.max_retries => {
                    log::warn!("Embedding retry {}/{} after error: {}", attempt + 1, self.max_retries, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err((e, _)) => return Err(e),
            }
        };

        if embedding.len() != self.dimensions {
            return Err(RagchatError::Embedding(format!(
                "Unexpected embedding dimension: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }
        log::debug!("Embedding API call took {:?} (attempt {})", start.elapsed(), attempt + 1);

        if let Some(cache) = &self.cache {
            cache.put(&self.model, text, embedding.clone());
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
