//! Per-scope semantic memory: markdown notes and conversation transcripts
//! turned into searchable, embedding-backed chunks.
//!
//! Each scope (one conversation or context) owns a directory with its source
//! files and a single SQLite database. Syncing re-chunks and re-embeds only
//! what changed; searching fuses vector and keyword results and favours
//! recent and frequently used passages.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search,
//!   append-only chunks retired via `superseded_at` / `superseded_by`
//! - **Embeddings**: any OpenAI-compatible `/v1/embeddings` endpoint, with an
//!   ordered fallback chain and rate-limit retry
//! - **Search**: weighted Reciprocal Rank Fusion plus recency and access
//!   boosts, with pluggable prefilter, expansion and rerank hooks
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`chunking`]: markdown and transcript chunkers
//! - [`db`]: SQLite initialization, schema and store metadata
//! - [`embedding`]: provider trait, HTTP provider and fallback router
//! - [`memory`]: store, sync manager, search engine and per-scope façade
//! - [`error`]: typed errors callers match on

pub mod chunking;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;

pub use error::MemoryError;
pub use memory::facade::{MemoryRegistry, SearchOutcome, SemanticMemory, SyncOutcome};
