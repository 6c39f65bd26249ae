//! Text-to-vector embedding via pluggable external providers.
//!
//! Provides the [`EmbeddingProvider`] trait, the [`EmbeddingError`] taxonomy
//! used to decide between retrying, falling back and giving up, and the
//! fallback router in [`router`]. The built-in HTTP provider in [`openai`]
//! speaks the OpenAI `/v1/embeddings` protocol. Chains are built from
//! configuration via [`create_providers`].

pub mod openai;
pub mod router;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EmbeddingConfig;

pub use router::{embed_with_fallback, EmbedOptions, EmbedOutcome};

/// Failure modes of a single provider call.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("{provider}: rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider}: HTTP {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider}: invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("{provider}: expected {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        provider: String,
        expected: usize,
        actual: usize,
    },

    #[error("{provider}: expected {expected} vectors, got {actual}")]
    CountMismatch {
        provider: String,
        expected: usize,
        actual: usize,
    },

    #[error("no embedding providers configured")]
    NoProviders,

    #[error("{provider}: {message}")]
    Other { provider: String, message: String },
}

impl EmbeddingError {
    /// Transient rate limiting: HTTP 429 or an error whose text says so.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status == 429,
            Self::Request { message, .. } | Self::Other { message, .. } => {
                looks_rate_limited(message)
            }
            _ => false,
        }
    }
}

fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
        || lower.contains("429")
}

/// An external service that turns text into vectors.
///
/// Implementations return one vector per input, in input order. Vectors do not
/// need to be normalized; the router normalizes everything it hands out.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable name used in logs and store metadata (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;

    /// Dimensionality of the vectors this provider is configured to produce.
    fn dimensions(&self) -> usize;

    /// Embed one batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// The embedding space a store is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingIdentity {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

impl EmbeddingIdentity {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            dimensions,
        }
    }

    /// Identity of a provider chain: the primary provider's name, model and dimensions.
    pub fn for_chain(providers: &[Arc<dyn EmbeddingProvider>]) -> Result<Self, EmbeddingError> {
        let primary = providers.first().ok_or(EmbeddingError::NoProviders)?;
        Ok(Self::new(primary.name(), primary.model(), primary.dimensions()))
    }
}

impl std::fmt::Display for EmbeddingIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({}d)", self.provider, self.model, self.dimensions)
    }
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Build the ordered provider chain described by `config.providers`.
///
/// Every provider is created with `config.dimensions`, since all members of a
/// chain must write into the same embedding space.
pub fn create_providers(config: &EmbeddingConfig) -> Result<Vec<Arc<dyn EmbeddingProvider>>> {
    anyhow::ensure!(
        !config.providers.is_empty(),
        "embedding.providers must list at least one provider"
    );

    let mut providers: Vec<Arc<dyn EmbeddingProvider>> = Vec::with_capacity(config.providers.len());
    for provider in &config.providers {
        match provider.kind.as_str() {
            "openai" | "openai-compatible" => {
                let built = openai::OpenAiCompatibleProvider::from_config(
                    provider,
                    config.dimensions,
                    config.timeout_secs,
                )?;
                providers.push(Arc::new(built));
            }
            other => anyhow::bail!(
                "unknown embedding provider kind: {other} (provider {}). Supported: openai",
                provider.name
            ),
        }
    }

    tracing::debug!(
        chain = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
        "embedding provider chain ready"
    );
    Ok(providers)
}
