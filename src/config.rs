use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MemoriaConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which every scope gets `scopes/<scope>/`.
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// When false, sync and search short-circuit to a disabled outcome.
    pub enabled: bool,
    pub dimensions: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
    /// Ordered provider chain: the first entry is primary, the rest are fallbacks.
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    /// Wire protocol. Only `"openai"` (any `/v1/embeddings` endpoint) is built in.
    pub kind: String,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key. `None` sends no auth header.
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub transcript_target_tokens: usize,
    pub transcript_min_tokens: usize,
    pub transcript_max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub rrf_k: f64,
    pub recency_half_life_days: f64,
    pub recency_weight: f64,
    pub access_weight: f64,
    pub min_score: f64,
    /// Each retrieval list fetches `top_k * candidate_multiplier` rows.
    pub candidate_multiplier: usize,
    pub snippet_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub similarity_threshold: f32,
    pub index_sessions: bool,
    /// Run a sync pass before every search.
    pub on_search: bool,
    /// Embedding cache rows kept after each sync, most recently used first. 0 keeps all.
    pub cache_max_entries: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_memoria_dir().to_string_lossy().into_owned(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dimensions: 1536,
            batch_size: 100,
            max_retries: 2,
            backoff_ms: 500,
            timeout_secs: 30,
            providers: vec![ProviderConfig::default()],
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "openai".into(),
            kind: "openai".into(),
            model: "text-embedding-3-small".into(),
            base_url: "https://api.openai.com".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 80,
            min_tokens: 100,
            max_tokens: 600,
            transcript_target_tokens: 300,
            transcript_min_tokens: 120,
            transcript_max_tokens: 520,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            vector_weight: 0.7,
            text_weight: 0.3,
            rrf_k: 60.0,
            recency_half_life_days: 30.0,
            recency_weight: 0.2,
            access_weight: 0.05,
            min_score: 0.0,
            candidate_multiplier: 4,
            snippet_chars: 200,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            index_sessions: true,
            on_search: true,
            cache_max_entries: 50_000,
        }
    }
}

/// Returns `~/.memoria/`, or `./.memoria/` when no home directory is known.
pub fn default_memoria_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memoria")
}

/// Returns the default config file path: `~/.memoria/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memoria_dir().join("config.toml")
}

impl MemoriaConfig {
    /// Reads `~/.memoria/config.toml` when present, then layers `MEMORIA_*` variables on top.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemoriaConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MEMORIA_DATA_DIR, MEMORIA_LOG_LEVEL, MEMORIA_EMBEDDING_ENABLED).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMORIA_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_EMBEDDING_ENABLED") {
            self.embedding.enabled = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Resolve the data directory, expanding `~` if needed.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
