//! Error types for the worker binary.
//!
//! [`WorkerError`] is the top-level error type that wraps all possible
//! failure modes during startup and while serving a context.

/// Top-level error for the worker binary.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: symbiont_sync::ConfigError,
    },

    /// A storage operation, the channel, or the coordinator failed.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying storage error.
        #[from]
        source: symbiont_sync::StorageError,
    },

    /// Reading input or waiting for a signal failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The context argument named no known context kind.
    #[error("unknown context {argument:?}; expected background, popup or content_script")]
    Usage {
        /// The rejected argument.
        argument: String,
    },

    /// Producing JSON output failed.
    #[error("serde error: {source}")]
    Serde {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}
