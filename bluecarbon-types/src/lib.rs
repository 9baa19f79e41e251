//! Core type definitions for the Blue Carbon sync layer.
//!
//! This crate defines the small set of identifier types shared by the
//! storage, request-client and sync crates:
//! - Entity ids as delivered by the server (numeric or textual)
//! - Monotonic outbound queue item ids
//! - Request correlation ids (UUID v7)
//! - Topic names

mod ids;
mod topic;

pub use ids::{EntityId, QueueItemId, RequestId};
pub use topic::Topic;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),
}
