//! Store metadata: schema version and the pinned embedding identity.
//!
//! The first open of a scope records which `(provider, model, dimensions)`
//! its vectors come from. Every later open compares the live configuration
//! against that record and refuses to continue on any difference.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::embedding::EmbeddingIdentity;
use crate::error::MemoryError;

/// The schema version this binary writes and understands.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const KEY_SCHEMA_VERSION: &str = "schema_version";
const KEY_PROVIDER: &str = "embedding_provider";
const KEY_MODEL: &str = "embedding_model";
const KEY_DIMENSIONS: &str = "embedding_dimensions";

pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM store_meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

/// Get the stored schema version, writing the current one on a fresh store.
pub fn check_schema_version(conn: &Connection) -> Result<u32> {
    let stored = get_meta(conn, KEY_SCHEMA_VERSION)?;
    let version = match stored {
        Some(value) => value.parse::<u32>().map_err(|_| {
            anyhow::anyhow!("corrupt store metadata: schema_version = {value:?}")
        })?,
        None => {
            set_meta(conn, KEY_SCHEMA_VERSION, &CURRENT_SCHEMA_VERSION.to_string())?;
            CURRENT_SCHEMA_VERSION
        }
    };

    if version > CURRENT_SCHEMA_VERSION {
        return Err(MemoryError::UnsupportedSchema {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        }
        .into());
    }

    tracing::debug!(schema_version = version, "schema version ok");
    Ok(version)
}

/// Read the pinned identity, if this store has one.
pub fn stored_identity(conn: &Connection) -> Result<Option<EmbeddingIdentity>> {
    let provider = get_meta(conn, KEY_PROVIDER)?;
    let model = get_meta(conn, KEY_MODEL)?;
    let dimensions = get_meta(conn, KEY_DIMENSIONS)?;

    match (provider, model, dimensions) {
        (Some(provider), Some(model), Some(dimensions)) => {
            let dimensions = dimensions.parse::<usize>().map_err(|_| {
                anyhow::anyhow!("corrupt store metadata: embedding_dimensions = {dimensions:?}")
            })?;
            Ok(Some(EmbeddingIdentity::new(provider, model, dimensions)))
        }
        (None, None, None) => Ok(None),
        _ => anyhow::bail!("corrupt store metadata: partial embedding identity"),
    }
}

/// Record `identity` on a fresh store, or validate it against the recorded one.
pub fn pin_embedding_identity(conn: &Connection, identity: &EmbeddingIdentity) -> Result<()> {
    let Some(stored) = stored_identity(conn)? else {
        set_meta(conn, KEY_PROVIDER, &identity.provider)?;
        set_meta(conn, KEY_MODEL, &identity.model)?;
        set_meta(conn, KEY_DIMENSIONS, &identity.dimensions.to_string())?;
        tracing::info!(embedding = %identity, "pinned embedding identity");
        return Ok(());
    };

    let mismatch = |field: &'static str, stored: String, configured: String| MemoryError::EmbeddingConfigMismatch {
        field,
        stored,
        configured,
    };

    if stored.provider != identity.provider {
        return Err(mismatch("provider", stored.provider, identity.provider.clone()).into());
    }
    if stored.model != identity.model {
        return Err(mismatch("model", stored.model, identity.model.clone()).into());
    }
    if stored.dimensions != identity.dimensions {
        return Err(mismatch(
            "dimensions",
            stored.dimensions.to_string(),
            identity.dimensions.to_string(),
        )
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn fresh_store_gets_current_version() {
        let conn = test_db();
        assert_eq!(check_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(
            get_meta(&conn, KEY_SCHEMA_VERSION).unwrap(),
            Some(CURRENT_SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = test_db();
        set_meta(&conn, KEY_SCHEMA_VERSION, "99").unwrap();
        let err = check_schema_version(&conn).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::UnsupportedSchema { found: 99, .. })
        ));
    }

    #[test]
    fn corrupt_schema_version_is_an_error() {
        let conn = test_db();
        set_meta(&conn, KEY_SCHEMA_VERSION, "two").unwrap();
        let err = check_schema_version(&conn).unwrap_err();
        assert!(format!("{err:#}").contains("corrupt store metadata"));
    }

    #[test]
    fn identity_is_pinned_then_validated() {
        let conn = test_db();
        let identity = EmbeddingIdentity::new("openai", "text-embedding-3-small", 1536);
        assert!(stored_identity(&conn).unwrap().is_none());

        pin_embedding_identity(&conn, &identity).unwrap();
        assert_eq!(stored_identity(&conn).unwrap(), Some(identity.clone()));

        // same identity again is fine
        pin_embedding_identity(&conn, &identity).unwrap();

        let other = EmbeddingIdentity::new("openai", "text-embedding-3-large", 1536);
        let err = pin_embedding_identity(&conn, &other).unwrap_err();
        match err.downcast_ref::<MemoryError>() {
            Some(MemoryError::EmbeddingConfigMismatch {
                field,
                stored,
                configured,
            }) => {
                assert_eq!(*field, "model");
                assert_eq!(stored, "text-embedding-3-small");
                assert_eq!(configured, "text-embedding-3-large");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn provider_mismatch_is_reported() {
        let conn = test_db();
        pin_embedding_identity(&conn, &EmbeddingIdentity::new("openai", "m", 8)).unwrap();
        let err =
            pin_embedding_identity(&conn, &EmbeddingIdentity::new("voyage", "m", 8)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::EmbeddingConfigMismatch { field: "provider", .. })
        ));
    }
}
