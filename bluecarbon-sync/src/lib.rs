//! Live-update sync engine for the Blue Carbon MRV client.
//!
//! Keeps local entity tables in step with the backend and survives flaky
//! networks.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Transport Manager**: holds at most one live connection, preferring a
//!   duplex socket, then a server-push stream, then HTTP polling
//! - **Reconnect Controller**: picks the next mechanism and the backoff delay
//! - **Subscription Registry**: refcounted topic interest, replayed on every
//!   new connection
//! - **Merge Engine**: idempotent, version-checked folding of updates into
//!   per-topic tables
//! - **SyncClient**: the facade that runs all of the above next to the
//!   request client and outbound queue from `bluecarbon-api`
//!
//! ## Data flow
//!
//! 1. **Connect**: try each mechanism in order, replaying subscriptions
//! 2. **Receive**: decode wire messages into [`InboundUpdate`]s
//! 3. **Merge**: apply updates in arrival order and publish table snapshots
//! 4. **Recover**: on loss, degrade to the next mechanism, then back off
//!
//! # Example
//!
//! ```no_run
//! use bluecarbon_api::Connectivity;
//! use bluecarbon_storage::MemoryStore;
//! use bluecarbon_sync::{SyncClient, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> bluecarbon_sync::SyncResult<()> {
//! let client = SyncClient::start(
//!     SyncConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Connectivity::online(),
//! )?;
//! let _projects = client.subscribe("projects")?;
//! client.connect();
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod manager;
pub mod merge;
pub mod poll;
pub mod protocol;
pub mod reconnect;
pub mod socket;
pub mod stream;
pub mod subscription;
pub mod transport;

pub use client::{SyncClient, SyncConfig, TopicChange};
pub use error::{SyncError, SyncResult};
pub use manager::TransportManager;
pub use merge::{ApplyOutcome, ConflictPolicy, EntityTable, MergeConfig, MergeEngine, TableView};
pub use protocol::{ControlAction, ControlFrame, InboundUpdate, UpdateOp, WireMessage};
pub use reconnect::{ConnectionState, Decision, ReconnectConfig, ReconnectController};
pub use subscription::{SubscriptionHandle, SubscriptionRegistry, WireChange};
pub use transport::{Connector, EndpointConfig, LiveConnection, Mechanism};
