//! Ordered provider fallback with per-batch rate-limit retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{l2_normalize, EmbeddingError, EmbeddingIdentity, EmbeddingProvider};
use crate::config::EmbeddingConfig;

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff: Duration,
    /// When set, any vector of a different length fails the provider.
    pub expected_dimensions: Option<usize>,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 2,
            backoff: Duration::from_millis(500),
            expected_dimensions: None,
        }
    }
}

impl EmbedOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            expected_dimensions: Some(config.dimensions),
        }
    }

    pub fn expecting(mut self, dimensions: usize) -> Self {
        self.expected_dimensions = Some(dimensions);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    /// One unit-length vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Name of the provider that answered.
    pub provider: String,
    /// Model of the provider that answered.
    pub model: String,
}

impl EmbedOutcome {
    /// The embedding space these vectors belong to.
    pub fn identity(&self) -> EmbeddingIdentity {
        let dimensions = self.vectors.first().map(Vec::len).unwrap_or_default();
        EmbeddingIdentity::new(&self.provider, &self.model, dimensions)
    }
}

/// Embed `texts` with the first provider in `providers` that succeeds.
///
/// Each provider sees the inputs in batches of `batch_size`. Rate-limit
/// errors are retried up to `max_retries` times, sleeping `backoff * attempt`
/// between tries. Any other error fails the provider and moves on to the
/// next. When every provider fails, the last error is returned.
pub async fn embed_with_fallback(
    texts: &[String],
    providers: &[Arc<dyn EmbeddingProvider>],
    options: &EmbedOptions,
) -> Result<EmbedOutcome, EmbeddingError> {
    if texts.is_empty() {
        let (provider, model) = providers
            .first()
            .map(|p| (p.name().to_string(), p.model().to_string()))
            .unwrap_or_default();
        return Ok(EmbedOutcome {
            vectors: Vec::new(),
            provider,
            model,
        });
    }

    let mut last_error = EmbeddingError::NoProviders;
    for provider in providers {
        match embed_with_provider(texts, provider.as_ref(), options).await {
            Ok(vectors) => {
                debug!(provider = provider.name(), count = vectors.len(), "embedded texts");
                return Ok(EmbedOutcome {
                    vectors,
                    provider: provider.name().to_string(),
                    model: provider.model().to_string(),
                });
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "embedding provider failed, trying next");
                last_error = e;
            }
        }
    }

    Err(last_error)
}

async fn embed_with_provider(
    texts: &[String],
    provider: &dyn EmbeddingProvider,
    options: &EmbedOptions,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let batch_size = options.batch_size.max(1);
    let mut vectors = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size) {
        let mut embedded = embed_batch_with_retry(batch, provider, options).await?;

        if embedded.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                provider: provider.name().to_string(),
                expected: batch.len(),
                actual: embedded.len(),
            });
        }

        for vector in &mut embedded {
            if let Some(expected) = options.expected_dimensions {
                if vector.len() != expected {
                    return Err(EmbeddingError::DimensionMismatch {
                        provider: provider.name().to_string(),
                        expected,
                        actual: vector.len(),
                    });
                }
            }
            l2_normalize(vector);
        }

        vectors.extend(embedded);
    }

    Ok(vectors)
}

async fn embed_batch_with_retry(
    batch: &[String],
    provider: &dyn EmbeddingProvider,
    options: &EmbedOptions,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut attempt: u32 = 0;
    loop {
        match provider.embed_batch(batch).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_rate_limit() && attempt < options.max_retries => {
                attempt += 1;
                let delay = options.backoff * attempt;
                debug!(
                    provider = provider.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
