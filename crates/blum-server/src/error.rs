//! Server error type.

/// Errors from starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured bind address does not parse.
    #[error("invalid bind address {addr:?}: {reason}")]
    InvalidBind {
        /// Configured value.
        addr: String,
        /// Parser message.
        reason: String,
    },
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
