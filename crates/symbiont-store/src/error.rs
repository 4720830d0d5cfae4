//! Error types for the storage engine.
//!
//! All errors are propagated via [`StoreError`] which wraps the underlying
//! [`sled`] and [`serde_json`] errors with context about which record was
//! involved.

/// Errors that can occur in the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `sled` operation failed (I/O, corruption, lock contention).
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// A record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The database directory could not be prepared.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An insert-only operation found the key already present.
    #[error("{tree} already contains {key}")]
    Duplicate {
        /// The tree that was written.
        tree: &'static str,
        /// The conflicting key.
        key: String,
    },

    /// An update targeted a key that does not exist.
    #[error("{tree} has no record {key}")]
    NotFound {
        /// The tree that was read.
        tree: &'static str,
        /// The missing key.
        key: String,
    },

    /// The engine was closed; no further operations are accepted.
    #[error("storage engine is closed")]
    Closed,
}
