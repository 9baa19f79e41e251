//! Config loading and local HTTP status API for the sync agent.

use std::{fs, path::Path, sync::Arc};
use anyhow::{Context, Result};
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bluecarbon_sync::{ConnectionState, SyncClient, SyncConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const AGENT_VERSION: &str = concat!("bluecarbon-agent/", env!("CARGO_PKG_VERSION"));

/// Contents of the agent's JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub sync: SyncConfig,
    /// Topics subscribed at startup.
    pub topics: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            topics: ["projects", "carbon_credits", "field_data", "notifications", "system_status"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TopicSummary {
    pub topic: String,
    pub rows: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub agent_version: String,
    pub connection: ConnectionState,
    pub online: bool,
    pub subscriptions: Vec<String>,
    pub topics: Vec<TopicSummary>,
    pub last_update: Option<DateTime<Utc>>,
    pub queue_pending: usize,
    pub dead_letters: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TopicResponse {
    pub topic: String,
    pub rows: Vec<Value>,
}

async fn status_handler(State(client): State<Arc<SyncClient>>) -> Json<StatusResponse> {
    let topics = client
        .topics()
        .into_iter()
        .map(|topic| TopicSummary {
            rows: client.table(topic.as_str()).map_or(0, |t| t.len()),
            topic: topic.to_string(),
        })
        .collect();
    Json(StatusResponse {
        agent_version: AGENT_VERSION.to_string(),
        connection: client.state(),
        online: client.connectivity().is_online(),
        subscriptions: client.subscriptions().iter().map(|t| t.to_string()).collect(),
        topics,
        last_update: client.last_update(),
        queue_pending: client.queue().pending_count(),
        dead_letters: client.queue().dead_letters().len(),
    })
}

async fn topic_handler(
    State(client): State<Arc<SyncClient>>,
    UrlPath(topic): UrlPath<String>,
) -> Response {
    match client.table(&topic) {
        Some(table) => Json(TopicResponse {
            topic,
            rows: table.to_vec(),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no data for topic {topic}")})),
        )
            .into_response(),
    }
}

/// Build the HTTP API router over a running sync client.
pub fn build_router(client: Arc<SyncClient>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/topics/{topic}", get(topic_handler))
        .with_state(client)
}
