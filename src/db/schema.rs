//! SQL DDL for a scope database.
//!
//! Defines `files`, `chunks`, `embedding_cache`, `store_meta`, the
//! `chunks_fts` (FTS5) index and the `chunks_vec` (vec0) index. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Source file ledger
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('memory','session')),
    updated_at TEXT NOT NULL,
    last_indexed_at TEXT NOT NULL
);

-- Append-only chunk table; edits retire rows instead of mutating them
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_key TEXT NOT NULL,
    path TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('memory','session')),
    session_id TEXT,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    embedding_provider TEXT NOT NULL,
    embedding_model TEXT NOT NULL,
    embedding_dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    superseded_at TEXT,
    superseded_by INTEGER REFERENCES chunks(id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_path_active ON chunks(path, superseded_at);
CREATE INDEX IF NOT EXISTS idx_chunks_key ON chunks(chunk_key);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(content_hash);
CREATE INDEX IF NOT EXISTS idx_chunks_superseded_by ON chunks(superseded_by);

-- Embeddings by content hash, scoped to one embedding identity
CREATE TABLE IF NOT EXISTS embedding_cache (
    content_hash TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (content_hash, provider, model, dimensions)
);

CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated ON embedding_cache(updated_at);

-- Full-text search (BM25); rowid = chunks.id, active chunks only
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(content);

-- Schema version and pinned embedding identity
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all regular tables and the FTS index. Idempotent.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

/// Create the vec0 index. The dimension is fixed at creation time, so this
/// runs only after the embedding identity has been validated.
pub fn init_vec_table(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(embedding float[{dimensions}]);"
    ))
}
