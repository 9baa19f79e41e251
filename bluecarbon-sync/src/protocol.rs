//! Live-update wire protocol.
//!
//! Both push mechanisms deliver the same JSON envelope:
//!
//! ```json
//! {"type": "update", "topic": "projects", "payload": {"id": 4, "name": "Mangrove"}}
//! ```
//!
//! [`decode`] turns one envelope into zero or more [`InboundUpdate`]s, which
//! is the only shape the merge engine understands. The socket mechanism also
//! carries [`ControlFrame`]s from client to server.

use crate::error::{SyncError, SyncResult};
use bluecarbon_types::{EntityId, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Row id used for the single `system_status` entry.
pub const SYSTEM_STATUS_ROW: &str = "current";

/// A message as received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Older servers send the body as `data`.
    #[serde(default, alias = "data")]
    pub payload: Value,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>, topic: Option<&str>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            topic: topic.map(str::to_string),
            payload,
        }
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("malformed message: {e}")))
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client-to-server subscription frame (socket mechanism only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub action: ControlAction,
    pub topic: Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

impl ControlFrame {
    pub fn subscribe(topic: Topic) -> Self {
        Self {
            action: ControlAction::Subscribe,
            topic,
        }
    }

    pub fn unsubscribe(topic: Topic) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            topic,
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What an inbound update does to a topic's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    Create,
    Update,
    Delete,
    BulkReplace,
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateOp::Create => "create",
            UpdateOp::Update => "update",
            UpdateOp::Delete => "delete",
            UpdateOp::BulkReplace => "bulk_replace",
        })
    }
}

/// A normalized update, ready for the merge engine.
///
/// For `create`/`update` the payload is the full row and `id` is its id.
/// For `delete` the payload is whatever the server sent (it may carry a
/// version). For `bulk_replace` the payload is an array of rows and `id`
/// is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundUpdate {
    pub topic: Topic,
    pub op: UpdateOp,
    pub id: Option<EntityId>,
    pub payload: Value,
}

impl InboundUpdate {
    pub fn create(topic: Topic, payload: Value) -> SyncResult<Self> {
        Self::upsert(topic, UpdateOp::Create, payload)
    }

    pub fn update(topic: Topic, payload: Value) -> SyncResult<Self> {
        Self::upsert(topic, UpdateOp::Update, payload)
    }

    fn upsert(topic: Topic, op: UpdateOp, payload: Value) -> SyncResult<Self> {
        let id = EntityId::from_payload(&payload).ok_or_else(|| {
            SyncError::Protocol(format!("{op} on {topic} without an id"))
        })?;
        Ok(Self {
            topic,
            op,
            id: Some(id),
            payload,
        })
    }

    /// A delete. The payload may be a row-like object or a bare id.
    pub fn delete(topic: Topic, payload: Value) -> SyncResult<Self> {
        let id = EntityId::from_payload(&payload)
            .or_else(|| EntityId::from_json(&payload))
            .ok_or_else(|| SyncError::Protocol(format!("delete on {topic} without an id")))?;
        Ok(Self {
            topic,
            op: UpdateOp::Delete,
            id: Some(id),
            payload,
        })
    }

    pub fn bulk_replace(topic: Topic, rows: Vec<Value>) -> Self {
        Self {
            topic,
            op: UpdateOp::BulkReplace,
            id: None,
            payload: Value::Array(rows),
        }
    }
}

fn require_topic(msg: &WireMessage) -> SyncResult<Topic> {
    let name = msg
        .topic
        .as_deref()
        .ok_or_else(|| SyncError::Protocol(format!("'{}' message without a topic", msg.kind)))?;
    Ok(Topic::new(name)?)
}

/// Extracts the row array for `topic` from a snapshot body.
///
/// Accepts a bare array, or an object holding the array under the topic
/// name (`{"carbon_credits": [...]}`; a dashed topic also matches its
/// underscored key).
pub fn snapshot_rows(topic: &Topic, body: &Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(rows) => Some(rows.clone()),
        Value::Object(map) => {
            let underscored = topic.as_str().replace('-', "_");
            map.get(topic.as_str())
                .or_else(|| map.get(&underscored))
                .and_then(Value::as_array)
                .cloned()
        }
        _ => None,
    }
}

/// Converts one wire message into merge-engine updates.
///
/// Unknown message types yield an empty list. Structural problems (a
/// missing topic or id) are protocol errors; the caller logs and drops
/// the message.
pub fn decode(msg: &WireMessage) -> SyncResult<Vec<InboundUpdate>> {
    let payload = msg.payload.clone();
    let updates = match msg.kind.as_str() {
        "create" => vec![InboundUpdate::create(require_topic(msg)?, payload)?],
        "update" => {
            let topic = require_topic(msg)?;
            // Polling-style servers send a whole collection as an update.
            if payload.is_array() || EntityId::from_payload(&payload).is_none() {
                match snapshot_rows(&topic, &payload) {
                    Some(rows) => vec![InboundUpdate::bulk_replace(topic, rows)],
                    None => vec![InboundUpdate::update(topic, payload)?],
                }
            } else {
                vec![InboundUpdate::update(topic, payload)?]
            }
        }
        "delete" => vec![InboundUpdate::delete(require_topic(msg)?, payload)?],
        "bulk_update" | "bulk_replace" => decode_bulk(msg)?,
        "notification" => vec![decode_notification(payload)?],
        "system_status_update" => {
            let mut row = with_id(payload, Value::Null);
            row["id"] = Value::String(SYSTEM_STATUS_ROW.to_string());
            vec![InboundUpdate::update(Topic::system_status(), row)?]
        }
        "project_created" => vec![InboundUpdate::create(Topic::projects(), payload)?],
        "project_updated" => vec![InboundUpdate::update(Topic::projects(), payload)?],
        "carbon_credit_issued" => vec![InboundUpdate::create(Topic::carbon_credits(), payload)?],
        "field_data_added" => vec![InboundUpdate::create(Topic::field_data(), payload)?],
        "ping" | "pong" | "heartbeat" | "connected" => {
            debug!("Ignoring {} message", msg.kind);
            Vec::new()
        }
        other => {
            warn!("Unknown live-update type: {}", other);
            Vec::new()
        }
    };
    Ok(updates)
}

fn decode_bulk(msg: &WireMessage) -> SyncResult<Vec<InboundUpdate>> {
    match (&msg.payload, msg.topic.as_deref()) {
        (Value::Array(rows), Some(_)) => Ok(vec![InboundUpdate::bulk_replace(
            require_topic(msg)?,
            rows.clone(),
        )]),
        (Value::Array(_), None) => Err(SyncError::Protocol(
            "bulk update array without a topic".to_string(),
        )),
        (Value::Object(map), _) => {
            let mut updates = Vec::with_capacity(map.len());
            for (name, rows) in map {
                let Value::Array(rows) = rows else {
                    debug!("Skipping non-array bulk section {}", name);
                    continue;
                };
                updates.push(InboundUpdate::bulk_replace(Topic::new(name.as_str())?, rows.clone()));
            }
            Ok(updates)
        }
        _ => Err(SyncError::Protocol(
            "bulk update payload must be an array or an object of arrays".to_string(),
        )),
    }
}

fn decode_notification(payload: Value) -> SyncResult<InboundUpdate> {
    let payload = if EntityId::from_payload(&payload).is_some() {
        payload
    } else {
        // Notifications are often fire-and-forget without ids.
        let id = uuid::Uuid::now_v7().to_string();
        with_id(payload, Value::String(id))
    };
    InboundUpdate::create(Topic::notifications(), payload)
}

fn with_id(payload: Value, id: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.entry("id").or_insert(id);
            Value::Object(map)
        }
        other => {
            let mut map = serde_json::Map::new();
            map.insert("id".to_string(), id);
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}
