use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use mneme_core::{Embedder, ProviderError};
use mneme_settings::EmbeddingSettings;

use crate::http;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Vec<f64>,
}

/// Embedding client for Ollama's `/api/embeddings` endpoint.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(connect_timeout)?,
            endpoint: http::endpoint(base_url, "api/embeddings"),
            model: model.into(),
            timeout,
        })
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self, ProviderError> {
        Self::new(
            &settings.base_url,
            settings.model.clone(),
            Duration::from_millis(settings.connect_timeout_ms),
            Duration::from_millis(settings.timeout_ms),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip(self, text), fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&EmbedRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| http::map_reqwest_error(&e, self.timeout))?;

        let resp = http::check_status(resp).await?;
        let body: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| http::map_reqwest_error(&e, self.timeout))?;

        if body.embedding.is_empty() {
            return Err(ProviderError::Decode("empty embedding".into()));
        }
        debug!(dims = body.embedding.len(), "embedding received");
        Ok(body.embedding)
    }
}
