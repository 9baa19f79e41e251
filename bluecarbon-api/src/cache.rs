//! Short-lived read cache.
//!
//! Entries are keyed by the full endpoint (path + query) and expire lazily:
//! an expired entry is dropped when it is next looked up. Writes invalidate
//! every entry in the same resource family, e.g. a `PUT /api/projects/4`
//! drops both `/api/projects` and `/api/projects/4?include=credits`.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// TTL cache for GET responses.
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    /// Returns a fresh entry, evicting it if it has expired.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops every entry in the same resource family as `endpoint`.
    /// Returns the number of entries removed.
    pub fn invalidate_family(&mut self, endpoint: &str) -> usize {
        let family = resource_family(endpoint);
        let before = self.entries.len();
        self.entries.retain(|key, _| resource_family(key) != family);
        before - self.entries.len()
    }

    /// Drops all expired entries.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including ones not yet lazily expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The collection an endpoint belongs to.
///
/// `/api/projects/4?x=1` -> `/api/projects`, `/health` -> `/health`.
pub fn resource_family(endpoint: &str) -> String {
    let path = endpoint.split_once('?').map_or(endpoint, |(p, _)| p);
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match segments.next() {
        Some("api") => match segments.next() {
            Some(collection) => format!("/api/{collection}"),
            None => "/api".to_string(),
        },
        Some(first) => format!("/{first}"),
        None => "/".to_string(),
    }
}
