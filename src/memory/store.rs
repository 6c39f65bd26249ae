//! Durable per-scope state: file ledger, chunk table, embedding cache and the
//! two search indexes.
//!
//! [`MemoryStore`] owns one SQLite connection. Chunks are append-only: the
//! write path inserts rows into `chunks`, `chunks_fts` and `chunks_vec` in one
//! transaction, and retirement ([`MemoryStore::supersede_chunks`]) stamps
//! `superseded_at` and removes the row from both indexes, so every search path
//! only ever sees active chunks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::db;
use crate::embedding::EmbeddingIdentity;
use crate::memory::types::{ChunkSource, FileRecord, NewChunk, SearchHit, StoreStats, StoredChunk};
use crate::memory::{bytes_to_embedding, embedding_to_bytes, now_timestamp};

const CHUNK_COLUMNS: &str = "id, chunk_key, path, source, session_id, start_line, end_line, \
     content, content_hash, token_count, embedding, embedding_provider, embedding_model, \
     embedding_dimensions, created_at, access_count, last_accessed_at, superseded_at, superseded_by";

pub struct MemoryStore {
    conn: Mutex<Connection>,
    identity: EmbeddingIdentity,
}

impl MemoryStore {
    /// Open the store at `path`, pinning or validating `identity`.
    pub fn open(path: impl AsRef<Path>, identity: EmbeddingIdentity) -> Result<Self> {
        let conn = db::open_database(path, &identity)?;
        Ok(Self::from_connection(conn, identity))
    }

    pub fn open_in_memory(identity: EmbeddingIdentity) -> Result<Self> {
        let conn = db::open_memory_database(&identity)?;
        Ok(Self::from_connection(conn, identity))
    }

    fn from_connection(conn: Connection, identity: EmbeddingIdentity) -> Self {
        Self {
            conn: Mutex::new(conn),
            identity,
        }
    }

    /// The embedding space every vector in this store belongs to.
    pub fn identity(&self) -> &EmbeddingIdentity {
        &self.identity
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("store lock poisoned: {e}"))
    }

    // -- file ledger --------------------------------------------------------

    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT path, hash, source, updated_at, last_indexed_at FROM files ORDER BY path",
        )?;
        let rows = stmt
            .query_map([], file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT path, hash, source, updated_at, last_indexed_at FROM files WHERE path = ?1",
                [path],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert_file(&self, record: &FileRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO files (path, hash, source, updated_at, last_indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                source = excluded.source,
                updated_at = excluded.updated_at,
                last_indexed_at = excluded.last_indexed_at",
            params![
                record.path,
                record.hash,
                record.source.as_str(),
                record.updated_at,
                record.last_indexed_at
            ],
        )?;
        Ok(())
    }

    pub fn delete_file(&self, path: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM files WHERE path = ?1", [path])?;
        Ok(deleted > 0)
    }

    // -- embedding cache ----------------------------------------------------

    /// Cached embeddings for the given content hashes computed under
    /// `identity`. Misses are simply absent from the map.
    pub fn get_embedding_cache(
        &self,
        identity: &EmbeddingIdentity,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT embedding FROM embedding_cache
             WHERE content_hash = ?1 AND provider = ?2 AND model = ?3 AND dimensions = ?4",
        )?;

        let mut found = HashMap::new();
        for hash in hashes {
            if found.contains_key(hash) {
                continue;
            }
            let blob: Option<Vec<u8>> = stmt
                .query_row(
                    params![
                        hash,
                        identity.provider,
                        identity.model,
                        identity.dimensions as i64
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(blob) = blob {
                found.insert(hash.clone(), bytes_to_embedding(&blob));
            }
        }
        Ok(found)
    }

    /// Cache embeddings computed under `identity`, refreshing `updated_at`
    /// of entries that already exist.
    pub fn upsert_embedding_cache(
        &self,
        identity: &EmbeddingIdentity,
        entries: &[(String, Vec<f32>)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.check_identity(identity)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO embedding_cache (content_hash, provider, model, dimensions, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(content_hash, provider, model, dimensions) DO UPDATE SET
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at",
            )?;
            for (hash, embedding) in entries {
                self.check_dimensions(embedding)?;
                stmt.execute(params![
                    hash,
                    identity.provider,
                    identity.model,
                    identity.dimensions as i64,
                    embedding_to_bytes(embedding),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Keep the `keep` most recently written cache entries and delete the
    /// rest. Returns how many rows were deleted.
    pub fn evict_embedding_cache(&self, keep: usize) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM embedding_cache WHERE rowid IN (
                SELECT rowid FROM embedding_cache
                ORDER BY updated_at DESC, rowid DESC
                LIMIT -1 OFFSET ?1
             )",
            [keep as i64],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, keep, "evicted embedding cache entries");
        }
        Ok(deleted)
    }

    // -- chunks -------------------------------------------------------------

    pub fn get_active_chunks_for_path(&self, path: &str) -> Result<Vec<StoredChunk>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE path = ?1 AND superseded_at IS NULL
             ORDER BY start_line, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([path], chunk_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_chunk(&self, id: i64) -> Result<Option<StoredChunk>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1");
        let chunk = conn.query_row(&sql, [id], chunk_from_row).optional()?;
        Ok(chunk)
    }

    /// The active chunks of `path` immediately before and after the given
    /// line range, by start line.
    pub fn get_adjacent_chunks(&self, path: &str, start_line: usize) -> Result<Vec<StoredChunk>> {
        let conn = self.lock()?;
        let before = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE path = ?1 AND superseded_at IS NULL AND start_line < ?2
             ORDER BY start_line DESC LIMIT 1"
        );
        let after = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE path = ?1 AND superseded_at IS NULL AND start_line > ?2
             ORDER BY start_line ASC LIMIT 1"
        );

        let mut neighbours = Vec::with_capacity(2);
        for sql in [before, after] {
            if let Some(chunk) = conn
                .query_row(&sql, params![path, start_line as i64], chunk_from_row)
                .optional()?
            {
                neighbours.push(chunk);
            }
        }
        Ok(neighbours)
    }

    /// Insert chunks with their embeddings into the table and both indexes.
    /// Returns the assigned row ids in input order.
    pub fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<Vec<i64>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        for chunk in chunks {
            self.check_dimensions(&chunk.embedding)
                .with_context(|| format!("chunk {} has the wrong dimensionality", chunk.chunk_key))?;
            if let Some(identity) = &chunk.embedded_by {
                self.check_identity(identity)
                    .with_context(|| format!("chunk {} was embedded elsewhere", chunk.chunk_key))?;
            }
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let identity = chunk.embedded_by.as_ref().unwrap_or(&self.identity);
            ids.push(insert_chunk(&tx, chunk, identity, &now)?);
        }
        tx.commit()?;

        tracing::debug!(count = ids.len(), "inserted chunks");
        Ok(ids)
    }

    /// Retire chunks, optionally pointing them at a replacement. Retired rows
    /// leave both search indexes. With a replacement, its access count and
    /// last access are raised to at least those of each retired chunk.
    ///
    /// Returns how many chunks were newly retired; already-retired ids are skipped.
    pub fn supersede_chunks(&self, ids: &[i64], superseded_by: Option<i64>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        let mut retired = 0;

        for &id in ids {
            if Some(id) == superseded_by {
                bail!("chunk {id} cannot supersede itself");
            }
            let updated = tx.execute(
                "UPDATE chunks SET superseded_at = ?2, superseded_by = ?3
                 WHERE id = ?1 AND superseded_at IS NULL",
                params![id, now, superseded_by],
            )?;
            if updated == 0 {
                continue;
            }
            tx.execute("DELETE FROM chunks_fts WHERE rowid = ?1", [id])?;
            tx.execute("DELETE FROM chunks_vec WHERE rowid = ?1", [id])?;
            if let Some(replacement) = superseded_by {
                carry_forward_access(&tx, id, replacement)?;
            }
            retired += 1;
        }

        tx.commit()?;
        Ok(retired)
    }

    // -- retrieval ----------------------------------------------------------

    /// Nearest active chunks to `embedding`, closest first.
    pub fn vector_search(&self, embedding: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.check_dimensions(embedding)
            .context("query embedding has the wrong dimensionality")?;

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, distance FROM chunks_vec
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?;
        let ranked: Vec<(i64, f64)> = stmt
            .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // L2 distance between unit vectors maps back to cosine similarity
        let scored = ranked
            .into_iter()
            .map(|(id, distance)| (id, 1.0 - distance * distance / 2.0))
            .collect::<Vec<_>>();
        fetch_hits(&conn, &scored)
    }

    /// BM25-ranked active chunks matching any term of `query`, best first.
    pub fn text_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let fts_query = escape_fts_query(query);
        if fts_query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, rank FROM chunks_fts
             WHERE chunks_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let ranked: Vec<(i64, f64)> = stmt
            .query_map(params![fts_query, limit as i64], |row| {
                let rank: f64 = row.get(1)?;
                Ok((row.get(0)?, -rank))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        fetch_hits(&conn, &ranked)
    }

    /// Bump access counters of the given chunks.
    pub fn mark_access(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_timestamp();
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE chunks SET access_count = access_count + 1, last_accessed_at = ?1 WHERE id = ?2",
            )?;
            for id in ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            files: count("SELECT COUNT(*) FROM files")?,
            active_chunks: count("SELECT COUNT(*) FROM chunks WHERE superseded_at IS NULL")?,
            superseded_chunks: count("SELECT COUNT(*) FROM chunks WHERE superseded_at IS NOT NULL")?,
            cached_embeddings: count("SELECT COUNT(*) FROM embedding_cache")?,
        })
    }

    /// Vectors from another provider may share the index only when they
    /// have the same dimensionality.
    fn check_identity(&self, identity: &EmbeddingIdentity) -> Result<()> {
        if identity.dimensions != self.identity.dimensions {
            bail!(
                "{identity} cannot be stored next to {}",
                self.identity
            );
        }
        Ok(())
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.identity.dimensions {
            bail!(
                "expected {} dimensions, got {}",
                self.identity.dimensions,
                embedding.len()
            );
        }
        Ok(())
    }
}

fn insert_chunk(
    tx: &Transaction,
    chunk: &NewChunk,
    identity: &EmbeddingIdentity,
    now: &str,
) -> Result<i64> {
    let bytes = embedding_to_bytes(&chunk.embedding);
    tx.execute(
        "INSERT INTO chunks (chunk_key, path, source, session_id, start_line, end_line, content,
            content_hash, token_count, embedding, embedding_provider, embedding_model,
            embedding_dimensions, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            chunk.chunk_key,
            chunk.path,
            chunk.source.as_str(),
            chunk.session_id,
            chunk.start_line as i64,
            chunk.end_line as i64,
            chunk.content,
            chunk.content_hash,
            chunk.token_count as i64,
            bytes,
            identity.provider,
            identity.model,
            identity.dimensions as i64,
            now
        ],
    )?;
    let id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO chunks_fts (rowid, content) VALUES (?1, ?2)",
        params![id, chunk.content],
    )?;
    tx.execute(
        "INSERT INTO chunks_vec (rowid, embedding) VALUES (?1, ?2)",
        params![id, bytes],
    )?;
    Ok(id)
}

fn carry_forward_access(tx: &Transaction, old: i64, new: i64) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE chunks SET
            access_count = MAX(access_count, (SELECT access_count FROM chunks WHERE id = ?2)),
            last_accessed_at = NULLIF(MAX(
                COALESCE(last_accessed_at, ''),
                COALESCE((SELECT last_accessed_at FROM chunks WHERE id = ?2), '')
            ), '')
         WHERE id = ?1",
        params![new, old],
    )?;
    Ok(())
}

/// Load active chunk rows for ranked ids, keeping the ranking order and
/// dropping ids that are no longer active.
fn fetch_hits(conn: &Connection, ranked: &[(i64, f64)]) -> Result<Vec<SearchHit>> {
    if ranked.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (1..=ranked.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT c.id, c.chunk_key, c.path, c.start_line, c.end_line, c.content,
                c.access_count, c.last_accessed_at, f.updated_at
         FROM chunks c LEFT JOIN files f ON f.path = c.path
         WHERE c.superseded_at IS NULL AND c.id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let ids: Vec<i64> = ranked.iter().map(|(id, _)| *id).collect();
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();

    let mut rows: HashMap<i64, SearchHit> = stmt
        .query_map(params.as_slice(), |row| {
            Ok(SearchHit {
                id: row.get(0)?,
                chunk_key: row.get(1)?,
                path: row.get(2)?,
                start_line: row.get::<_, i64>(3)? as usize,
                end_line: row.get::<_, i64>(4)? as usize,
                content: row.get(5)?,
                raw_score: 0.0,
                access_count: row.get::<_, i64>(6)? as u64,
                last_accessed_at: row.get(7)?,
                file_updated_at: row.get(8)?,
            })
        })?
        .map(|r| r.map(|hit| (hit.id, hit)))
        .collect::<Result<_, _>>()?;

    Ok(ranked
        .iter()
        .filter_map(|(id, score)| {
            rows.remove(id).map(|mut hit| {
                hit.raw_score = *score;
                hit
            })
        })
        .collect())
}

/// Turn free text into an FTS5 query that matches any of its words. Each
/// word is quoted so user input never becomes FTS5 syntax.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path: row.get(0)?,
        hash: row.get(1)?,
        source: parse_source(row, 2)?,
        updated_at: row.get(3)?,
        last_indexed_at: row.get(4)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<StoredChunk> {
    let blob: Vec<u8> = row.get(10)?;
    Ok(StoredChunk {
        id: row.get(0)?,
        chunk_key: row.get(1)?,
        path: row.get(2)?,
        source: parse_source(row, 3)?,
        session_id: row.get(4)?,
        start_line: row.get::<_, i64>(5)? as usize,
        end_line: row.get::<_, i64>(6)? as usize,
        content: row.get(7)?,
        content_hash: row.get(8)?,
        token_count: row.get::<_, i64>(9)? as usize,
        embedding: bytes_to_embedding(&blob),
        embedding_provider: row.get(11)?,
        embedding_model: row.get(12)?,
        embedding_dimensions: row.get::<_, i64>(13)? as usize,
        created_at: row.get(14)?,
        access_count: row.get::<_, i64>(15)? as u64,
        last_accessed_at: row.get(16)?,
        superseded_at: row.get(17)?,
        superseded_by: row.get(18)?,
    })
}

fn parse_source(row: &Row<'_>, idx: usize) -> rusqlite::Result<ChunkSource> {
    let raw: String = row.get(idx)?;
    raw.parse::<ChunkSource>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}
