//! HTTP request client and offline outbound queue for the Blue Carbon
//! sync layer.
//!
//! # Architecture
//!
//! ```text
//! caller ──► ApiClient ──┬── online ──► reqwest (retry 5xx/network/timeout)
//!                        │                 └── GET responses ──► ResponseCache
//!                        └── offline ──► OutboundQueue ──► KvStore
//!                                            │
//!            Connectivity ── restored ──► drain loop ──► RequestSender (ApiClient)
//! ```
//!
//! The queue only depends on the [`RequestSender`] seam, so the client can
//! own the queue without a reference cycle.

mod cache;
mod client;
mod config;
mod connectivity;
mod error;
mod outbox;
mod request;

pub use cache::{ResponseCache, resource_family};
pub use client::{ApiClient, ApiResponse, ClientStats, REQUEST_ID_HEADER, RequestSender};
pub use config::{ApiConfig, RequestOptions};
pub use connectivity::Connectivity;
pub use error::{ApiError, ApiResult};
pub use outbox::{DrainReport, OutboundQueue, QueueConfig, QueueEvent, QueueItem, QueueItemStatus};
pub use request::{ApiRequest, HttpMethod};
