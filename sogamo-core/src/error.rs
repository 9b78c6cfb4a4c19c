//! Error types for sogamo-core

use thiserror::Error;

/// Main error type for the sogamo-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Snapshot database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A record could not be turned into a wire object
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Delivery to the analytics service failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Snapshot storage is unavailable or holds unreadable data
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Failure reported by a [`Transport`](crate::delivery::Transport).
///
/// The split decides what happens to the claimed batch: retryable failures
/// put it back at the front of its lane, permanent ones drop it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network error, timeout, or a server-side status (5xx, 408, 429)
    #[error("retryable: {0}")]
    Retryable(String),

    /// The service rejected the batch itself (4xx)
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Result type alias for sogamo-core
pub type Result<T> = std::result::Result<T, Error>;
