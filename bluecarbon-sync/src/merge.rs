//! Merge engine.
//!
//! Folds [`InboundUpdate`]s into per-topic entity tables. Each table keeps
//! its rows in arrival order; an update to a known id replaces the row in
//! place. Applying the same update twice leaves the table unchanged.
//!
//! Tables are published as `Arc` snapshots through a [`TableView`]. Every
//! apply builds the new table copy-on-write and swaps it in whole, so a
//! reader sees a bulk replace either entirely or not at all.
//!
//! # Versions
//!
//! Under [`ConflictPolicy::VersionChecked`], an update whose version field
//! is not newer than the stored row's is rejected as stale. A versioned
//! delete leaves a tombstone so a late update older than the delete cannot
//! resurrect the row. Each topic keeps at most
//! [`MergeConfig::max_tombstones`]; the oldest are forgotten first. Rows
//! without a version are last-write-wins.

use crate::protocol::{InboundUpdate, UpdateOp};
use bluecarbon_types::{EntityId, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// How concurrent updates to the same id are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Reject updates whose version is not newer than the stored one.
    #[default]
    VersionChecked,
    /// The last update applied wins.
    LastWriteWins,
}

/// Merge engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub conflict_policy: ConflictPolicy,
    /// Payload field carrying the row version.
    pub version_field: String,
    /// Maximum rows kept per topic; the oldest rows are evicted first.
    pub topic_limits: HashMap<String, usize>,
    /// Tombstones kept per topic.
    pub max_tombstones: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let mut topic_limits = HashMap::new();
        topic_limits.insert(Topic::NOTIFICATIONS.to_string(), 50);
        Self {
            conflict_policy: ConflictPolicy::VersionChecked,
            version_field: "version".to_string(),
            topic_limits,
            max_tombstones: 1_000,
        }
    }
}

/// A comparable row version.
#[derive(Debug, Clone, PartialEq)]
enum Version {
    Number(f64),
    Text(String),
}

impl Version {
    fn of(payload: &Value, field: &str) -> Option<Self> {
        match payload.get(field)? {
            Value::Number(n) => n.as_f64().map(Version::Number),
            Value::String(s) if !s.is_empty() => Some(
                s.parse::<f64>()
                    .map(Version::Number)
                    .unwrap_or_else(|_| Version::Text(s.clone())),
            ),
            _ => None,
        }
    }

    /// `None` when the two versions cannot be compared.
    fn compare(&self, other: &Version) -> Option<Ordering> {
        match (self, other) {
            (Version::Number(a), Version::Number(b)) => a.partial_cmp(b),
            (Version::Text(a), Version::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Result of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new row was appended.
    Inserted,
    /// An existing row was replaced in place.
    Updated,
    /// A row was removed.
    Deleted,
    /// The topic was replaced wholesale.
    Replaced { rows: usize },
    /// The update matched the current state (duplicate, or delete of an
    /// absent id).
    Unchanged,
    /// The update was older than the stored row and was dropped.
    Stale,
}

impl ApplyOutcome {
    /// Whether the table content changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted
                | ApplyOutcome::Updated
                | ApplyOutcome::Deleted
                | ApplyOutcome::Replaced { .. }
        )
    }
}

/// The rows of one topic.
#[derive(Debug, Clone, Default)]
pub struct EntityTable {
    rows: HashMap<EntityId, Value>,
    order: Vec<EntityId>,
    tombstones: HashMap<EntityId, Version>,
    /// Tombstoned ids, oldest first.
    buried: VecDeque<EntityId>,
}

impl EntityTable {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Value> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.rows.contains_key(id)
    }

    /// Ids in list order.
    pub fn ids(&self) -> &[EntityId] {
        &self.order
    }

    /// Rows in list order.
    pub fn rows(&self) -> impl Iterator<Item = &Value> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.rows().cloned().collect()
    }

    fn upsert(&mut self, id: EntityId, row: Value) -> ApplyOutcome {
        match self.rows.get_mut(&id) {
            Some(existing) if *existing == row => ApplyOutcome::Unchanged,
            Some(existing) => {
                *existing = row;
                ApplyOutcome::Updated
            }
            None => {
                self.order.push(id.clone());
                self.rows.insert(id, row);
                ApplyOutcome::Inserted
            }
        }
    }

    fn remove(&mut self, id: &EntityId) -> bool {
        if self.rows.remove(id).is_some() {
            self.order.retain(|o| o != id);
            true
        } else {
            false
        }
    }

    fn bury(&mut self, id: EntityId, version: Version, cap: usize) {
        if self.tombstones.insert(id.clone(), version).is_none() {
            self.buried.push_back(id);
        }
        while self.buried.len() > cap {
            if let Some(oldest) = self.buried.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }

    fn unbury(&mut self, id: &EntityId) {
        if self.tombstones.remove(id).is_some() {
            self.buried.retain(|b| b != id);
        }
    }

    fn evict_to(&mut self, limit: usize) {
        if self.order.len() > limit {
            let excess = self.order.len() - limit;
            for id in self.order.drain(..excess) {
                self.rows.remove(&id);
            }
        }
    }
}

/// Read-only, shareable view of the latest published tables.
#[derive(Debug, Clone, Default)]
pub struct TableView {
    tables: Arc<RwLock<HashMap<Topic, Arc<EntityTable>>>>,
}

impl TableView {
    /// The current snapshot of one topic.
    pub fn table(&self, topic: &str) -> Option<Arc<EntityTable>> {
        self.tables.read().ok()?.get(topic).cloned()
    }

    /// Rows of one topic in list order; empty for an unknown topic.
    pub fn rows(&self, topic: &str) -> Vec<Value> {
        self.table(topic).map(|t| t.to_vec()).unwrap_or_default()
    }

    /// Topics with a table, sorted by name.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .tables
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    fn publish(&self, topic: Topic, table: Arc<EntityTable>) {
        let mut tables = self.tables.write().unwrap_or_else(|p| p.into_inner());
        tables.insert(topic, table);
    }
}

/// Sole writer of the entity tables.
#[derive(Debug, Default)]
pub struct MergeEngine {
    config: MergeConfig,
    tables: HashMap<Topic, Arc<EntityTable>>,
    view: TableView,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            tables: HashMap::new(),
            view: TableView::default(),
        }
    }

    /// A handle for readers.
    pub fn view(&self) -> TableView {
        self.view.clone()
    }

    pub fn table(&self, topic: &str) -> Option<&EntityTable> {
        self.tables.get(topic).map(Arc::as_ref)
    }

    pub fn rows(&self, topic: &str) -> Vec<Value> {
        self.table(topic).map(EntityTable::to_vec).unwrap_or_default()
    }

    /// Applies one update and publishes the resulting table if it changed.
    pub fn apply(&mut self, update: &InboundUpdate) -> ApplyOutcome {
        let current = self.tables.get(update.topic.as_str()).cloned().unwrap_or_default();
        let mut table = Arc::clone(&current);
        let outcome = {
            let t = Arc::make_mut(&mut table);
            match update.op {
                UpdateOp::Create | UpdateOp::Update => self.apply_upsert(t, update),
                UpdateOp::Delete => self.apply_delete(t, update),
                UpdateOp::BulkReplace => self.apply_bulk(t, update),
            }
        };

        let dirty = outcome.changed()
            || table.tombstones != current.tombstones
            || !self.tables.contains_key(update.topic.as_str());
        if dirty {
            if let Some(limit) = self.config.topic_limits.get(update.topic.as_str()) {
                Arc::make_mut(&mut table).evict_to(*limit);
            }
            self.tables.insert(update.topic.clone(), Arc::clone(&table));
            self.view.publish(update.topic.clone(), table);
        }
        debug!("{} {} -> {:?}", update.op, update.topic, outcome);
        outcome
    }

    fn version_checked(&self) -> bool {
        self.config.conflict_policy == ConflictPolicy::VersionChecked
    }

    fn apply_upsert(&self, table: &mut EntityTable, update: &InboundUpdate) -> ApplyOutcome {
        let Some(id) = update.id.clone() else {
            warn!("{} on {} without an id, dropped", update.op, update.topic);
            return ApplyOutcome::Unchanged;
        };

        if self.version_checked() {
            if let Some(incoming) = Version::of(&update.payload, &self.config.version_field) {
                let stored = table
                    .rows
                    .get(&id)
                    .and_then(|row| Version::of(row, &self.config.version_field))
                    .or_else(|| table.tombstones.get(&id).cloned());
                let ordering = stored.map(|s| incoming.compare(&s));
                if let Some(Some(Ordering::Less | Ordering::Equal)) = ordering {
                    if table.rows.get(&id) == Some(&update.payload) {
                        return ApplyOutcome::Unchanged;
                    }
                    debug!("Stale {} for {}/{} rejected", update.op, update.topic, id);
                    return ApplyOutcome::Stale;
                }
                table.unbury(&id);
            }
        }
        table.upsert(id, update.payload.clone())
    }

    fn apply_delete(&self, table: &mut EntityTable, update: &InboundUpdate) -> ApplyOutcome {
        let Some(id) = update.id.clone() else {
            return ApplyOutcome::Unchanged;
        };

        if self.version_checked() {
            if let Some(incoming) = Version::of(&update.payload, &self.config.version_field) {
                let stored = table
                    .rows
                    .get(&id)
                    .and_then(|row| Version::of(row, &self.config.version_field));
                if let Some(stored) = stored {
                    if incoming.compare(&stored) == Some(Ordering::Less) {
                        debug!("Stale delete for {}/{} rejected", update.topic, id);
                        return ApplyOutcome::Stale;
                    }
                }
                let newer = match table.tombstones.get(&id) {
                    Some(existing) => incoming.compare(existing) == Some(Ordering::Greater),
                    None => true,
                };
                if newer {
                    table.bury(id.clone(), incoming, self.config.max_tombstones);
                }
            }
        }

        if table.remove(&id) {
            ApplyOutcome::Deleted
        } else {
            ApplyOutcome::Unchanged
        }
    }

    fn apply_bulk(&self, table: &mut EntityTable, update: &InboundUpdate) -> ApplyOutcome {
        let Some(rows) = update.payload.as_array() else {
            warn!("bulk_replace on {} without a row array, dropped", update.topic);
            return ApplyOutcome::Unchanged;
        };

        let mut fresh = EntityTable::default();
        for row in rows {
            match EntityId::from_payload(row) {
                Some(id) => {
                    fresh.upsert(id, row.clone());
                }
                None => warn!("Row without an id in {} snapshot skipped", update.topic),
            }
        }

        if fresh.order == table.order && fresh.rows == table.rows && table.tombstones.is_empty() {
            return ApplyOutcome::Unchanged;
        }
        let count = fresh.len();
        *table = fresh;
        ApplyOutcome::Replaced { rows: count }
    }
}
