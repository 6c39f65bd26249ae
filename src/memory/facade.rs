//! Per-scope entry point.
//!
//! [`SemanticMemory`] wires store, provider chain, sync manager and search
//! engine together on first use and serializes `sync`/`search` on one scope.
//! [`MemoryRegistry`] hands out one shared instance per scope id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tokio::sync::OnceCell;
use tracing::info;

use crate::chunking::hash_text;
use crate::config::MemoriaConfig;
use crate::embedding::{create_providers, embed_with_fallback, EmbedOptions, EmbeddingIdentity, EmbeddingProvider};
use crate::error::MemoryError;
use crate::memory::hooks::SearchHooks;
use crate::memory::search::{SearchEngine, SearchQuery};
use crate::memory::store::MemoryStore;
use crate::memory::sync::{SyncManager, SyncOptions, SyncReport};
use crate::memory::types::{SearchResult, StoreStats};

/// Database file inside a scope directory.
pub const DB_FILE: &str = "memory.db";

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Embeddings are disabled in configuration; nothing was touched.
    Disabled,
    Completed(SyncReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Embeddings are disabled in configuration. Distinct from an empty result.
    Disabled,
    Results(Vec<SearchResult>),
}

impl SearchOutcome {
    /// Results, treating a disabled configuration as no results.
    pub fn into_results(self) -> Vec<SearchResult> {
        match self {
            Self::Disabled => Vec::new(),
            Self::Results(results) => results,
        }
    }
}

struct Components {
    store: Arc<MemoryStore>,
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    embed: EmbedOptions,
    sync: SyncManager,
    engine: SearchEngine,
}

pub struct SemanticMemory {
    scope_id: String,
    root: PathBuf,
    providers: Option<Vec<Arc<dyn EmbeddingProvider>>>,
    hooks: SearchHooks,
    components: OnceCell<Components>,
    run_lock: tokio::sync::Mutex<()>,
}

impl SemanticMemory {
    /// A scope rooted at `root` (holding `memory/`, `sessions/` and the database).
    pub fn new(scope_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            scope_id: scope_id.into(),
            root: root.into(),
            providers: None,
            hooks: SearchHooks::default(),
            components: OnceCell::new(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Use these providers instead of building the chain from configuration.
    pub fn with_providers(mut self, providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_hooks(mut self, hooks: SearchHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    /// Build everything on first call. Later calls reuse the first build, so
    /// configuration changes need a new instance.
    async fn components(&self, config: &MemoriaConfig) -> Result<&Components> {
        self.components
            .get_or_try_init(|| async { self.build(config) })
            .await
    }

    fn build(&self, config: &MemoriaConfig) -> Result<Components> {
        let providers = match &self.providers {
            Some(providers) => providers.clone(),
            None => create_providers(&config.embedding)?,
        };
        let identity = EmbeddingIdentity::for_chain(&providers)?;
        let store = Arc::new(
            MemoryStore::open(self.db_path(), identity.clone())
                .with_context(|| format!("failed to open store for scope {}", self.scope_id))?,
        );

        let embed = EmbedOptions::from_config(&config.embedding).expecting(identity.dimensions);
        let sync = SyncManager::new(
            &self.scope_id,
            &self.root,
            Arc::clone(&store),
            providers.clone(),
            SyncOptions::from_config(config),
        );
        let engine = SearchEngine::new(Arc::clone(&store), config.search.clone()).with_hooks(self.hooks.clone());

        info!(scope = %self.scope_id, embedding = %identity, "semantic memory ready");
        Ok(Components {
            store,
            providers,
            embed,
            sync,
            engine,
        })
    }

    pub async fn sync(&self, config: &MemoriaConfig) -> Result<SyncOutcome> {
        if !config.embedding.enabled {
            return Ok(SyncOutcome::Disabled);
        }
        let _guard = self.run_lock.lock().await;
        let components = self.components(config).await?;
        let report = components.sync.sync().await?;
        Ok(SyncOutcome::Completed(report))
    }

    /// Search this scope. `top_k` defaults to `search.default_top_k`.
    ///
    /// Syncs first when `sync.on_search` is set. Provider failures are
    /// returned as errors, never as an empty result.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        config: &MemoriaConfig,
    ) -> Result<SearchOutcome> {
        if !config.embedding.enabled {
            return Ok(SearchOutcome::Disabled);
        }
        let _guard = self.run_lock.lock().await;
        let components = self.components(config).await?;

        if config.sync.on_search {
            components.sync.sync().await?;
        }

        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchOutcome::Results(Vec::new()));
        }

        let outcome = embed_with_fallback(&[query.to_string()], &components.providers, &components.embed)
            .await
            .context("failed to embed query")?;
        let embedding = outcome
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("provider {} returned no query embedding", outcome.provider))?;

        let results = components
            .engine
            .search(&SearchQuery {
                query,
                embedding: &embedding,
                top_k: top_k.unwrap_or(config.search.default_top_k),
            })
            .await?;
        Ok(SearchOutcome::Results(results))
    }

    /// Row counts, or `None` when embeddings are disabled.
    pub async fn stats(&self, config: &MemoriaConfig) -> Result<Option<StoreStats>> {
        if !config.embedding.enabled {
            return Ok(None);
        }
        let components = self.components(config).await?;
        Ok(Some(components.store.stats()?))
    }
}

/// One [`SemanticMemory`] per scope under `<data_dir>/scopes/`.
pub struct MemoryRegistry {
    data_dir: PathBuf,
    providers: Option<Vec<Arc<dyn EmbeddingProvider>>>,
    hooks: SearchHooks,
    scopes: Mutex<HashMap<String, Arc<SemanticMemory>>>,
}

impl MemoryRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            providers: None,
            hooks: SearchHooks::default(),
            scopes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &MemoriaConfig) -> Self {
        Self::new(config.resolved_data_dir())
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_hooks(mut self, hooks: SearchHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Directory of a scope, after sanitizing its id.
    pub fn scope_dir(&self, scope_id: &str) -> Result<PathBuf> {
        let dir = sanitize_scope_id(scope_id)?;
        Ok(self.data_dir.join("scopes").join(dir))
    }

    /// The shared instance for `scope_id`, created on first request.
    pub fn scope(&self, scope_id: &str) -> Result<Arc<SemanticMemory>> {
        let root = self.scope_dir(scope_id)?;
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|e| anyhow!("registry lock poisoned: {e}"))?;

        let memory = scopes.entry(scope_id.to_string()).or_insert_with(|| {
            let mut memory = SemanticMemory::new(scope_id, root).with_hooks(self.hooks.clone());
            if let Some(providers) = &self.providers {
                memory = memory.with_providers(providers.clone());
            }
            Arc::new(memory)
        });
        Ok(Arc::clone(memory))
    }
}

/// Map a scope id onto a single safe directory name.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`; when anything was
/// replaced, a short hash of the raw id is appended so distinct ids stay
/// distinct.
pub fn sanitize_scope_id(raw: &str) -> Result<String, MemoryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(MemoryError::InvalidScope(raw.to_string()));
    }

    let cleaned: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned == raw {
        Ok(cleaned)
    } else {
        Ok(format!("{cleaned}-{}", &hash_text(raw)[..8]))
    }
}
