//! HTTP provider for any endpoint speaking the OpenAI `/v1/embeddings` protocol.
//!
//! Covers OpenAI itself as well as Ollama, LM Studio and most hosted
//! gateways. Status codes are mapped onto [`EmbeddingError`] so the router can
//! tell rate limiting (retry) from everything else (fall through).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};
use crate::config::ProviderConfig;

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dims: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dims,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(self)
    }

    /// Build from a provider entry. Fails if `api_key_env` names a variable
    /// that is not set.
    pub fn from_config(config: &ProviderConfig, dims: usize, timeout_secs: u64) -> Result<Self> {
        let mut provider = Self::new(&config.name, &config.base_url, &config.model, dims)
            .with_timeout(Duration::from_secs(timeout_secs))?;

        if let Some(var) = &config.api_key_env {
            let key = std::env::var(var).with_context(|| {
                format!("{var} environment variable not set (embedding provider {})", config.name)
            })?;
            provider = provider.with_api_key(key);
        }

        Ok(provider)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    fn invalid(&self, message: impl Into<String>) -> EmbeddingError {
        EmbeddingError::InvalidResponse {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| EmbeddingError::Request {
            provider: self.name.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 {
                EmbeddingError::RateLimited {
                    provider: self.name.clone(),
                    message,
                }
            } else {
                EmbeddingError::Http {
                    provider: self.name.clone(),
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| self.invalid(e.to_string()))?;

        order_by_index(parsed.data).ok_or_else(|| self.invalid("duplicate or out-of-range index"))
    }
}

/// Put response rows back into input order. Rows without an `index` keep
/// their position.
fn order_by_index(mut data: Vec<EmbeddingData>) -> Option<Vec<Vec<f32>>> {
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
        let in_range = data
            .iter()
            .enumerate()
            .all(|(pos, d)| d.index == Some(pos));
        if !in_range {
            return None;
        }
    }
    Some(data.into_iter().map(|d| d.embedding).collect())
}
