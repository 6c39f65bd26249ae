//! Typed errors callers are expected to match on.
//!
//! Most of the crate propagates failures as [`anyhow::Error`] with context,
//! the way the rest of the plumbing does. The variants here are the ones a
//! caller needs to tell apart. They survive `.context(...)` wrapping and can
//! be recovered with [`anyhow::Error::downcast_ref`].
//!
//! Embedding-provider failures live in [`crate::embedding::EmbeddingError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The store was built under a different embedding space than the one
    /// currently configured. Never resolved by silently re-embedding.
    #[error(
        "embedding {field} mismatch: store was built with `{stored}`, configuration says `{configured}`"
    )]
    EmbeddingConfigMismatch {
        field: &'static str,
        stored: String,
        configured: String,
    },

    /// The sqlite-vec extension could not be loaded into the connection.
    #[error("sqlite-vec extension unavailable: {0}")]
    MissingExtension(String),

    /// The database was written by a newer schema than this binary knows.
    #[error("store schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// A scope identifier that cannot be mapped to a storage location.
    #[error("invalid scope id: {0:?}")]
    InvalidScope(String),
}
