pub mod meta;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use crate::embedding::EmbeddingIdentity;
use crate::error::MemoryError;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) a scope database at the given path, pinned to `identity`.
///
/// Fails with [`MemoryError::EmbeddingConfigMismatch`] when the database was
/// built under a different embedding identity, and with
/// [`MemoryError::MissingExtension`] when sqlite-vec is not available.
pub fn open_database(path: impl AsRef<Path>, identity: &EmbeddingIdentity) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    prepare(&conn, identity)
        .with_context(|| format!("failed to prepare database at {}", path.display()))?;

    tracing::info!(path = %path.display(), embedding = %identity, "database initialized");
    Ok(conn)
}

/// Open an in-memory database with the full schema. Used by tests and
/// throwaway scopes.
pub fn open_memory_database(identity: &EmbeddingIdentity) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    prepare(&conn, identity)?;
    Ok(conn)
}

fn prepare(conn: &Connection, identity: &EmbeddingIdentity) -> Result<()> {
    check_vec_extension(conn)?;
    schema::init_schema(conn).context("failed to initialize schema")?;
    meta::check_schema_version(conn)?;
    meta::pin_embedding_identity(conn, identity)?;
    schema::init_vec_table(conn, identity.dimensions).context("failed to create vector index")?;
    Ok(())
}

fn check_vec_extension(conn: &Connection) -> Result<()> {
    let version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .map_err(|e| MemoryError::MissingExtension(e.to_string()))?;
    tracing::debug!(sqlite_vec = %version, "sqlite-vec loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> EmbeddingIdentity {
        EmbeddingIdentity::new("test", "test-model", 8)
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scopes").join("a").join("memory.db");
        let _conn = open_database(&path, &identity()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn reopen_with_same_identity_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        drop(open_database(&path, &identity()).unwrap());
        open_database(&path, &identity()).unwrap();
    }

    #[test]
    fn reopen_with_other_dimensions_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        drop(open_database(&path, &identity()).unwrap());

        let other = EmbeddingIdentity::new("test", "test-model", 16);
        let err = open_database(&path, &other).unwrap_err();
        match err.downcast_ref::<MemoryError>() {
            Some(MemoryError::EmbeddingConfigMismatch { field, .. }) => {
                assert_eq!(*field, "dimensions")
            }
            other => panic!("expected EmbeddingConfigMismatch, got {other:?}"),
        }
    }
}
