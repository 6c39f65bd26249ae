//! Row and result types shared by the store, sync manager and search engine.
//!
//! [`StoredChunk`] is a full chunk row, [`NewChunk`] is what the sync manager
//! inserts, [`SearchHit`] is one entry of a retrieval list, and
//! [`SearchResult`] is what callers get back from a search.

use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingIdentity;

/// Where a chunk's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    /// Markdown under `<scope>/memory/`.
    Memory,
    /// JSON Lines transcripts under `<scope>/sessions/`.
    Session,
}

impl ChunkSource {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "session" => Ok(Self::Session),
            _ => Err(format!("unknown chunk source: {s}")),
        }
    }
}

/// One indexed source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative to the scope root, `/`-separated.
    pub path: String,
    /// SHA-256 hex of the file contents.
    pub hash: String,
    pub source: ChunkSource,
    pub updated_at: String,
    pub last_indexed_at: String,
}

/// A chunk ready for insertion.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_key: String,
    pub path: String,
    pub source: ChunkSource,
    pub session_id: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
    pub token_count: usize,
    pub embedding: Vec<f32>,
    /// Who computed `embedding` when it was not the store's own provider,
    /// e.g. a fallback provider answering for the primary.
    pub embedded_by: Option<EmbeddingIdentity>,
}

/// A full row of the `chunks` table.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub id: i64,
    pub chunk_key: String,
    pub path: String,
    pub source: ChunkSource,
    pub session_id: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
    pub token_count: usize,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub created_at: String,
    pub access_count: u64,
    pub last_accessed_at: Option<String>,
    pub superseded_at: Option<String>,
    pub superseded_by: Option<i64>,
}

impl StoredChunk {
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    pub fn embedding_identity(&self) -> EmbeddingIdentity {
        EmbeddingIdentity::new(
            &self.embedding_provider,
            &self.embedding_model,
            self.embedding_dimensions,
        )
    }
}

/// One entry of a vector or text retrieval list, joined with the metadata
/// scoring needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub chunk_key: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    /// List-specific relevance, higher is better: cosine similarity for
    /// vector hits, negated BM25 rank for text hits.
    pub raw_score: f64,
    /// `files.updated_at` for the chunk's path.
    pub file_updated_at: Option<String>,
    pub access_count: u64,
    pub last_accessed_at: Option<String>,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Row id of the chunk.
    pub chunk_idx: i64,
    pub chunk_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    /// `base_score + recency_boost + access_boost`, possibly rescored by a reranker.
    pub score: f64,
    /// Weighted reciprocal rank fusion score.
    pub base_score: f64,
    pub recency_boost: f64,
    pub access_boost: f64,
    pub snippet: String,
}

/// Row counts for one scope store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub files: u64,
    pub active_chunks: u64,
    pub superseded_chunks: u64,
    pub cached_embeddings: u64,
}
