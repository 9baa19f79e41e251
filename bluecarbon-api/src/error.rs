//! Request client error types.

use thiserror::Error;

/// Result type for request-client and queue operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can occur while talking to the backend or persisting the
/// outbound queue.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response (DNS, refused, reset).
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-2xx status.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// A read was attempted while offline and nothing usable was cached.
    #[error("offline and no cached response for {0}")]
    Offline(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] bluecarbon_storage::StorageError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("queue item not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// Network failures, timeouts and 5xx responses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout => true,
            ApiError::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// 4xx responses and malformed requests will never succeed as sent.
    pub fn is_terminal(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => (400..500).contains(status),
            ApiError::InvalidRequest(_) => true,
            _ => false,
        }
    }

    /// Returns the HTTP status if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if let Some(status) = e.status() {
            ApiError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_builder() {
            ApiError::InvalidRequest(e.to_string())
        } else if e.is_decode() {
            ApiError::Network(format!("failed to read response body: {e}"))
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
