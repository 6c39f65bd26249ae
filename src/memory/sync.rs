//! Reconciles a scope's store with the files on disk.
//!
//! [`SyncManager::sync`] is idempotent: unchanged files (same SHA-256) cost one
//! read, removed files have their chunks retired, and changed files are
//! re-chunked with embeddings taken from the cache where the chunk text
//! recurs. Old chunks of a changed file are linked to their closest new
//! chunk when the two are similar enough, so an edited passage keeps its
//! access history.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunking::{
    chunk_markdown, chunk_transcript, hash_text, parse_transcript_jsonl, ChunkingOptions, TextChunk,
};
use crate::config::MemoriaConfig;
use crate::embedding::{embed_with_fallback, EmbedOptions, EmbeddingIdentity, EmbeddingProvider};
use crate::memory::store::MemoryStore;
use crate::memory::types::{ChunkSource, FileRecord, NewChunk, StoredChunk};
use crate::memory::{cosine_similarity, format_timestamp, now_timestamp};

/// Subdirectory of a scope holding markdown notes.
pub const MEMORY_DIR: &str = "memory";
/// Subdirectory of a scope holding JSON Lines transcripts.
pub const SESSIONS_DIR: &str = "sessions";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub markdown: ChunkingOptions,
    pub transcript: ChunkingOptions,
    pub embed: EmbedOptions,
    /// Minimum cosine similarity for an old chunk to be linked to a new one.
    pub similarity_threshold: f32,
    pub index_sessions: bool,
    /// Embedding cache rows kept after a sync. 0 keeps all.
    pub cache_max_entries: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            markdown: ChunkingOptions::markdown(),
            transcript: ChunkingOptions::transcript(),
            embed: EmbedOptions::default(),
            similarity_threshold: 0.9,
            index_sessions: true,
            cache_max_entries: 50_000,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &MemoriaConfig) -> Self {
        Self {
            markdown: ChunkingOptions::markdown_from_config(&config.chunking),
            transcript: ChunkingOptions::transcript_from_config(&config.chunking),
            embed: EmbedOptions::from_config(&config.embedding),
            similarity_threshold: config.sync.similarity_threshold,
            index_sessions: config.sync.index_sessions,
            cache_max_entries: config.sync.cache_max_entries,
        }
    }
}

/// What one sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_inserted: usize,
    pub chunks_superseded: usize,
    /// Superseded chunks that point at a replacement.
    pub chunks_linked: usize,
    pub embeddings_computed: usize,
    pub embeddings_reused: usize,
    pub cache_entries_evicted: usize,
    /// Provider that answered the last embedding request, if any was made.
    pub provider: Option<String>,
}

/// A chunk embedding and the space it was computed in.
#[derive(Debug, Clone)]
struct Embedded {
    vector: Vec<f32>,
    identity: EmbeddingIdentity,
}

#[derive(Debug, Clone)]
struct SourceFile {
    /// Relative to the scope root, `/`-separated.
    rel_path: String,
    abs_path: PathBuf,
    source: ChunkSource,
}

pub struct SyncManager {
    scope_id: String,
    root: PathBuf,
    store: Arc<MemoryStore>,
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    options: SyncOptions,
}

impl SyncManager {
    pub fn new(
        scope_id: impl Into<String>,
        root: impl Into<PathBuf>,
        store: Arc<MemoryStore>,
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        options: SyncOptions,
    ) -> Self {
        let mut options = options;
        options.embed.expected_dimensions = Some(store.identity().dimensions);
        Self {
            scope_id: scope_id.into(),
            root: root.into(),
            store,
            providers,
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn sync(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let sources = self.discover()?;
        report.files_scanned = sources.len();

        let current: HashSet<&str> = sources.iter().map(|s| s.rel_path.as_str()).collect();
        for record in self.store.list_files()? {
            if !current.contains(record.path.as_str()) {
                self.remove_file(&record.path, &mut report)?;
            }
        }

        for source in &sources {
            self.sync_file(source, &mut report)
                .await
                .with_context(|| format!("failed to index {}", source.rel_path))?;
        }

        if self.options.cache_max_entries > 0 {
            report.cache_entries_evicted =
                self.store.evict_embedding_cache(self.options.cache_max_entries)?;
        }

        info!(
            scope = %self.scope_id,
            scanned = report.files_scanned,
            indexed = report.files_indexed,
            removed = report.files_removed,
            inserted = report.chunks_inserted,
            superseded = report.chunks_superseded,
            embedded = report.embeddings_computed,
            reused = report.embeddings_reused,
            "sync complete"
        );
        Ok(report)
    }

    fn discover(&self) -> Result<Vec<SourceFile>> {
        let mut sources = Vec::new();
        self.walk(MEMORY_DIR, &["md", "markdown"], ChunkSource::Memory, &mut sources)?;
        if self.options.index_sessions {
            self.walk(SESSIONS_DIR, &["jsonl"], ChunkSource::Session, &mut sources)?;
        }
        sources.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(sources)
    }

    fn walk(
        &self,
        dir: &str,
        extensions: &[&str],
        source: ChunkSource,
        out: &mut Vec<SourceFile>,
    ) -> Result<()> {
        let base = self.root.join(dir);
        if !base.is_dir() {
            return Ok(());
        }

        let walker = WalkDir::new(&base)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = entry.with_context(|| format!("failed to walk {}", base.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| extensions.iter().any(|x| ext.eq_ignore_ascii_case(x)));
            if !matches {
                continue;
            }
            out.push(SourceFile {
                rel_path: relative_path(&self.root, entry.path()),
                abs_path: entry.path().to_path_buf(),
                source,
            });
        }
        Ok(())
    }

    fn remove_file(&self, path: &str, report: &mut SyncReport) -> Result<()> {
        let active: Vec<i64> = self
            .store
            .get_active_chunks_for_path(path)?
            .iter()
            .map(|c| c.id)
            .collect();
        report.chunks_superseded += self.store.supersede_chunks(&active, None)?;
        self.store.delete_file(path)?;
        report.files_removed += 1;
        debug!(path, retired = active.len(), "removed file");
        Ok(())
    }

    async fn sync_file(&self, file: &SourceFile, report: &mut SyncReport) -> Result<()> {
        let content = match tokio::fs::read_to_string(&file.abs_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.store.get_file(&file.rel_path)?.is_some() {
                    self.remove_file(&file.rel_path, report)?;
                }
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", file.abs_path.display()))
            }
        };

        let hash = hash_text(&content);
        if let Some(record) = self.store.get_file(&file.rel_path)? {
            if record.hash == hash {
                report.files_unchanged += 1;
                return Ok(());
            }
        }

        let chunks = self.chunk(file, &content);
        let embeddings = self.embeddings_for(&chunks, report).await?;

        // read before inserting, so the new rows are not mistaken for predecessors
        let previous = self.store.get_active_chunks_for_path(&file.rel_path)?;

        let session_id = match file.source {
            ChunkSource::Session => Path::new(&file.rel_path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned()),
            ChunkSource::Memory => None,
        };
        let new_chunks: Vec<NewChunk> = chunks
            .iter()
            .filter_map(|chunk| {
                let embedded = embeddings.get(&chunk.content_hash)?;
                let embedded_by = (&embedded.identity != self.store.identity())
                    .then(|| embedded.identity.clone());
                Some(NewChunk {
                    chunk_key: chunk.chunk_id.clone(),
                    path: file.rel_path.clone(),
                    source: file.source,
                    session_id: session_id.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    content: chunk.content.clone(),
                    content_hash: chunk.content_hash.clone(),
                    token_count: chunk.token_count,
                    embedding: embedded.vector.clone(),
                    embedded_by,
                })
            })
            .collect();

        let ids = self.store.insert_chunks(&new_chunks)?;
        report.chunks_inserted += ids.len();

        let mut cache_entries: HashMap<EmbeddingIdentity, Vec<(String, Vec<f32>)>> = HashMap::new();
        for (hash, embedded) in embeddings {
            cache_entries
                .entry(embedded.identity)
                .or_default()
                .push((hash, embedded.vector));
        }
        for (identity, entries) in &cache_entries {
            self.store.upsert_embedding_cache(identity, entries)?;
        }

        self.retire_previous(&previous, &new_chunks, &ids, report)?;

        let now = now_timestamp();
        let updated_at = modified_time(&file.abs_path).await.unwrap_or_else(|| now.clone());
        self.store.upsert_file(&FileRecord {
            path: file.rel_path.clone(),
            hash,
            source: file.source,
            updated_at,
            last_indexed_at: now,
        })?;

        report.files_indexed += 1;
        debug!(
            path = %file.rel_path,
            chunks = ids.len(),
            previous = previous.len(),
            "indexed file"
        );
        Ok(())
    }

    fn chunk(&self, file: &SourceFile, content: &str) -> Vec<TextChunk> {
        match file.source {
            ChunkSource::Memory => chunk_markdown(&file.rel_path, content, &self.options.markdown),
            ChunkSource::Session => chunk_transcript(
                &self.scope_id,
                &parse_transcript_jsonl(content),
                &self.options.transcript,
            ),
        }
    }

    /// Embedding for every distinct chunk hash: cache hits first, the rest
    /// embedded in one routed request.
    ///
    /// Only vectors computed under the store's own identity are reused, so a
    /// fallback provider's answers never pass for the primary's.
    async fn embeddings_for(
        &self,
        chunks: &[TextChunk],
        report: &mut SyncReport,
    ) -> Result<HashMap<String, Embedded>> {
        let hashes: Vec<String> = chunks.iter().map(|c| c.content_hash.clone()).collect();
        let identity = self.store.identity();
        let mut embeddings: HashMap<String, Embedded> = self
            .store
            .get_embedding_cache(identity, &hashes)?
            .into_iter()
            .map(|(hash, vector)| {
                let embedded = Embedded {
                    vector,
                    identity: identity.clone(),
                };
                (hash, embedded)
            })
            .collect();
        report.embeddings_reused += embeddings.len();

        let mut seen = HashSet::new();
        let misses: Vec<&TextChunk> = chunks
            .iter()
            .filter(|c| !embeddings.contains_key(&c.content_hash))
            .filter(|c| seen.insert(c.content_hash.as_str()))
            .collect();
        if misses.is_empty() {
            return Ok(embeddings);
        }

        let texts: Vec<String> = misses.iter().map(|c| c.content.clone()).collect();
        let outcome = embed_with_fallback(&texts, &self.providers, &self.options.embed)
            .await
            .context("embedding failed")?;

        let answered_by = outcome.identity();
        if &answered_by != identity {
            warn!(
                scope = %self.scope_id,
                pinned = %identity,
                answered_by = %answered_by,
                "chunks embedded by a fallback provider"
            );
        }
        report.embeddings_computed += outcome.vectors.len();
        report.provider = Some(outcome.provider);
        for (chunk, vector) in misses.iter().zip(outcome.vectors) {
            let embedded = Embedded {
                vector,
                identity: answered_by.clone(),
            };
            embeddings.insert(chunk.content_hash.clone(), embedded);
        }
        Ok(embeddings)
    }

    /// Supersede every previously active chunk, linking each to its most
    /// similar replacement when the similarity clears the threshold.
    fn retire_previous(
        &self,
        previous: &[StoredChunk],
        new_chunks: &[NewChunk],
        new_ids: &[i64],
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut unlinked = Vec::new();
        for old in previous {
            let old_identity = old.embedding_identity();
            let best = new_chunks
                .iter()
                .zip(new_ids)
                .filter_map(|(chunk, id)| {
                    if chunk.content_hash == old.content_hash {
                        return Some((*id, 1.0));
                    }
                    // vectors from different models are not comparable
                    let identity = chunk.embedded_by.as_ref().unwrap_or(self.store.identity());
                    (identity == &old_identity)
                        .then(|| (*id, cosine_similarity(&old.embedding, &chunk.embedding)))
                })
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match best {
                Some((new_id, similarity)) if similarity >= self.options.similarity_threshold => {
                    let retired = self.store.supersede_chunks(&[old.id], Some(new_id))?;
                    report.chunks_superseded += retired;
                    report.chunks_linked += retired;
                }
                _ => unlinked.push(old.id),
            }
        }
        report.chunks_superseded += self.store.supersede_chunks(&unlinked, None)?;
        Ok(())
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn modified_time(path: &Path) -> Option<String> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    Some(format_timestamp(DateTime::<Utc>::from(modified)))
}
