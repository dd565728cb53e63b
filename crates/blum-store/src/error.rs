//! Store error taxonomy.

/// Errors returned by the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` reported a failure.
    #[error("database error: {0}")]
    Database(String),

    /// The key does not exist.
    #[error("not found: {namespace}/{key}")]
    NotFound {
        /// Logical namespace.
        namespace: String,
        /// Record key.
        key: String,
    },

    /// Optimistic concurrency check failed. Nothing was written.
    ///
    /// An `actual` of `0` means the record does not exist.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Record key.
        key: String,
        /// Version the caller believed current.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Column name.
        column: &'static str,
        /// Decoder message.
        detail: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure while preparing the database location.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
