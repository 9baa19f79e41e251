//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error (connection refused, reset, handshake failure).
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request client error.
    #[error(transparent)]
    Api(#[from] bluecarbon_api::ApiError),

    /// Invalid topic name.
    #[error(transparent)]
    Topic(#[from] bluecarbon_types::Error),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
