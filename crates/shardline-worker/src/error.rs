//! Error types for the shard worker binary.

/// Top-level error for the shard worker.
///
/// Each variant wraps one startup or shutdown failure so `main` can
/// propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: shardline_core::ConfigError,
    },

    /// Installing the shutdown signal handler failed.
    #[error("signal error: {source}")]
    Signal {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}
