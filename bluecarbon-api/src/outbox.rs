//! Durable offline outbound queue.
//!
//! Mutations that cannot be delivered right now (offline, or a retryable
//! failure) are persisted here and replayed later in strict submission order.
//!
//! # Store layout
//!
//! Inside the configured namespace:
//! - `item:<id>`: one JSON [`QueueItem`] per retained item (including dead ones)
//! - `index`: JSON array of the ids still waiting for delivery, ascending
//! - `seq`: the next id to allocate
//!
//! Every change that touches both an item and the index goes through
//! [`KvStore::apply_batch`], so a crash never leaves them disagreeing.
//!
//! # Delivery
//!
//! The head item is sent first and nothing behind it is attempted until it
//! has either been delivered or dead-lettered. A retryable failure reschedules
//! the head with exponential backoff and ends the drain pass; a terminal
//! failure (4xx) dead-letters it immediately. Delivery is at-least-once: an
//! item that was in flight when the process died is sent again on restart.

use crate::client::RequestSender;
use crate::connectivity::Connectivity;
use crate::error::{ApiError, ApiResult};
use crate::request::{ApiRequest, HttpMethod};
use bluecarbon_storage::{KvOp, KvStore};
use bluecarbon_types::QueueItemId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const INDEX_KEY: &str = "index";
const SEQ_KEY: &str = "seq";
const ITEM_PREFIX: &str = "item:";

/// Configuration for the outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Store namespace owned by the queue.
    pub namespace: String,
    /// Delivery attempts before an item is dead-lettered.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt (ms).
    pub retry_base_delay_ms: u64,
    /// Upper bound for the per-item backoff (ms).
    pub retry_max_delay_ms: u64,
    /// Opportunistic drain interval while online (ms).
    pub drain_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "outbound_queue".to_string(),
            max_attempts: 5,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 5 * 60 * 1_000,
            drain_interval_ms: 30_000,
        }
    }
}

impl QueueConfig {
    /// Backoff after `attempts` failed attempts: `base * 2^(attempts-1)`, capped.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}

/// Lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting for its first delivery attempt.
    Pending,
    /// Currently being sent.
    InFlight,
    /// At least one retryable failure; waiting for `next_attempt_at`.
    Failed,
    /// Retained for inspection; never retried automatically.
    Dead,
}

/// A persisted mutation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: QueueItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    /// The request to replay.
    pub fn request(&self) -> ApiRequest {
        ApiRequest::new(self.method, self.endpoint.clone(), self.body.clone())
    }

    /// Whether the item may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueItemStatus::Dead => false,
            _ => self.next_attempt_at.is_none_or(|at| at <= now),
        }
    }

    fn store_key(id: QueueItemId) -> String {
        format!("{ITEM_PREFIX}{}", id.to_key())
    }
}

/// Notifications emitted by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { id: QueueItemId },
    Delivered { id: QueueItemId },
    Rescheduled {
        id: QueueItemId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// An item was moved to the dead-letter set. Hosts should surface this
    /// to the user.
    DeadLettered { id: QueueItemId, reason: String },
    Requeued { id: QueueItemId },
    Discarded { id: QueueItemId },
    /// A waiting item was withdrawn before delivery.
    Cancelled { id: QueueItemId },
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub delivered: Vec<QueueItemId>,
    pub dead_lettered: Vec<QueueItemId>,
    /// The head item that failed and was rescheduled, ending the pass.
    pub rescheduled: Option<QueueItemId>,
    /// The head item was still backing off when the pass started.
    pub waiting_on: Option<QueueItemId>,
    /// The pass stopped early because the queue was paused or went offline.
    pub interrupted: bool,
    /// Items still awaiting delivery after the pass.
    pub remaining: usize,
}

#[derive(Debug)]
struct QueueState {
    /// Items awaiting delivery, in submission order.
    active: BTreeMap<QueueItemId, QueueItem>,
    dead: BTreeMap<QueueItemId, QueueItem>,
    next_id: QueueItemId,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            active: BTreeMap::new(),
            dead: BTreeMap::new(),
            next_id: QueueItemId::new(1),
        }
    }
}

impl QueueState {
    fn index_json(&self) -> ApiResult<String> {
        let ids: Vec<QueueItemId> = self.active.keys().copied().collect();
        Ok(serde_json::to_string(&ids)?)
    }

    fn index_json_with(&self, extra: QueueItemId) -> ApiResult<String> {
        let mut ids: Vec<QueueItemId> = self.active.keys().copied().collect();
        if let Err(pos) = ids.binary_search(&extra) {
            ids.insert(pos, extra);
        }
        Ok(serde_json::to_string(&ids)?)
    }

    fn index_json_without(&self, removed: QueueItemId) -> ApiResult<String> {
        let ids: Vec<QueueItemId> = self.active.keys().copied().filter(|id| *id != removed).collect();
        Ok(serde_json::to_string(&ids)?)
    }
}

/// The offline outbound queue. Sole writer of its store namespace.
pub struct OutboundQueue {
    store: Arc<dyn KvStore>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Serializes drain passes.
    drain_lock: tokio::sync::Mutex<()>,
    /// Explicit pause requested by the host.
    paused: AtomicBool,
    /// Set by the drain loop while connectivity is down.
    offline: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
    wake: Notify,
}

impl OutboundQueue {
    /// Opens the queue, reloading every retained item from the store.
    ///
    /// Items that were in flight when the process stopped go back to
    /// `pending` and are delivered again.
    pub fn open(store: Arc<dyn KvStore>, config: QueueConfig) -> ApiResult<Self> {
        let state = Self::load(store.as_ref(), &config.namespace)?;
        info!(
            "Outbound queue loaded: {} pending, {} dead",
            state.active.len(),
            state.dead.len()
        );
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            store,
            config,
            state: Mutex::new(state),
            drain_lock: tokio::sync::Mutex::new(()),
            paused: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            events,
            wake: Notify::new(),
        })
    }

    fn load(store: &dyn KvStore, ns: &str) -> ApiResult<QueueState> {
        let mut state = QueueState::default();

        let indexed: Vec<QueueItemId> = match store.get(ns, INDEX_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        let mut max_seen: Option<QueueItemId> = None;
        let mut repaired = false;
        for key in store.list_keys(ns)? {
            if !key.starts_with(ITEM_PREFIX) {
                continue;
            }
            let Some(raw) = store.get(ns, &key)? else {
                continue;
            };
            let mut item: QueueItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!("Skipping unreadable queue entry {}: {}", key, e);
                    continue;
                }
            };
            max_seen = max_seen.max(Some(item.id));

            if item.status == QueueItemStatus::Dead {
                state.dead.insert(item.id, item);
                continue;
            }
            if item.status == QueueItemStatus::InFlight {
                debug!("Queue item {} was in flight at shutdown, resending", item.id);
                item.status = if item.attempt_count == 0 {
                    QueueItemStatus::Pending
                } else {
                    QueueItemStatus::Failed
                };
            }
            if !indexed.contains(&item.id) {
                warn!("Queue item {} missing from index, restoring", item.id);
                repaired = true;
            }
            state.active.insert(item.id, item);
        }

        if indexed.iter().any(|id| !state.active.contains_key(id)) {
            warn!("Queue index referenced missing items, rebuilding");
            repaired = true;
        }

        let stored_seq = match store.get(ns, SEQ_KEY)? {
            Some(raw) => raw
                .parse::<QueueItemId>()
                .map_err(|e| ApiError::Config(format!("corrupt queue sequence {raw:?}: {e}")))?,
            None => QueueItemId::new(1),
        };
        let after_max = max_seen.map_or(QueueItemId::new(1), |id| id.next());
        state.next_id = stored_seq.max(after_max);

        if repaired {
            store.set(ns, INDEX_KEY, &state.index_json()?)?;
        }

        Ok(state)
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The state is only mutated after a successful store write, so the
        // data behind a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ns(&self) -> &str {
        &self.config.namespace
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribes to queue notifications.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    // ── Submission ───────────────────────────────────────────────

    /// Persists a mutation for later delivery.
    pub fn enqueue(&self, request: ApiRequest) -> ApiResult<QueueItemId> {
        self.insert(request, 0, None)
    }

    /// Persists a mutation whose first delivery already failed with a
    /// retryable error. It is first retried after the normal backoff.
    pub fn enqueue_failed(&self, request: ApiRequest, error: &ApiError) -> ApiResult<QueueItemId> {
        let retry_at = Utc::now() + self.backoff(1);
        self.insert(request, 1, Some((retry_at, error.to_string())))
    }

    fn insert(
        &self,
        request: ApiRequest,
        attempt_count: u32,
        failure: Option<(DateTime<Utc>, String)>,
    ) -> ApiResult<QueueItemId> {
        request.validate()?;
        if !request.method.is_mutation() {
            return Err(ApiError::InvalidRequest(format!(
                "only mutations can be queued, got {} {}",
                request.method, request.endpoint
            )));
        }

        let mut state = self.state();
        let id = state.next_id;
        let (status, next_attempt_at, last_error) = match failure {
            Some((at, err)) => (QueueItemStatus::Failed, Some(at), Some(err)),
            None => (QueueItemStatus::Pending, None, None),
        };
        let item = QueueItem {
            id,
            endpoint: request.endpoint,
            method: request.method,
            body: request.body,
            created_at: Utc::now(),
            attempt_count,
            status,
            next_attempt_at,
            last_error,
        };

        self.store.apply_batch(
            self.ns(),
            &[
                KvOp::set(QueueItem::store_key(id), serde_json::to_string(&item)?),
                KvOp::set(INDEX_KEY, state.index_json_with(id)?),
                KvOp::set(SEQ_KEY, id.next().to_string()),
            ],
        )?;
        state.next_id = id.next();
        state.active.insert(id, item);
        let pending = state.active.len();
        drop(state);

        info!(
            "Request queued for offline delivery: {} (id={}, queue length {})",
            self.describe(id),
            id,
            pending
        );
        self.emit(QueueEvent::Enqueued { id });
        self.wake.notify_one();
        Ok(id)
    }

    fn describe(&self, id: QueueItemId) -> String {
        let state = self.state();
        state
            .active
            .get(&id)
            .or_else(|| state.dead.get(&id))
            .map(|i| format!("{} {}", i.method, i.endpoint))
            .unwrap_or_default()
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Number of items awaiting delivery (pending, in flight or failed).
    pub fn pending_count(&self) -> usize {
        self.state().active.len()
    }

    /// Items awaiting delivery, in delivery order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.state().active.values().cloned().collect()
    }

    /// Dead-lettered items, oldest first.
    pub fn dead_letters(&self) -> Vec<QueueItem> {
        self.state().dead.values().cloned().collect()
    }

    pub fn get(&self, id: QueueItemId) -> Option<QueueItem> {
        let state = self.state();
        state.active.get(&id).or_else(|| state.dead.get(&id)).cloned()
    }

    // ── Operator actions ─────────────────────────────────────────

    /// Moves a dead item back into the queue with a fresh attempt budget.
    /// It keeps its id, so it is delivered in its original position.
    pub fn requeue_dead(&self, id: QueueItemId) -> ApiResult<()> {
        let mut state = self.state();
        let mut item = state
            .dead
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        item.status = QueueItemStatus::Pending;
        item.attempt_count = 0;
        item.next_attempt_at = None;

        self.store.apply_batch(
            self.ns(),
            &[
                KvOp::set(QueueItem::store_key(id), serde_json::to_string(&item)?),
                KvOp::set(INDEX_KEY, state.index_json_with(id)?),
            ],
        )?;
        state.dead.remove(&id);
        state.active.insert(id, item);
        drop(state);

        info!("Dead queue item {} requeued", id);
        self.emit(QueueEvent::Requeued { id });
        self.wake.notify_one();
        Ok(())
    }

    /// Permanently removes a dead item.
    pub fn discard_dead(&self, id: QueueItemId) -> ApiResult<()> {
        let mut state = self.state();
        if !state.dead.contains_key(&id) {
            return Err(ApiError::NotFound(id.to_string()));
        }
        self.store.delete(self.ns(), &QueueItem::store_key(id))?;
        state.dead.remove(&id);
        drop(state);

        info!("Dead queue item {} discarded", id);
        self.emit(QueueEvent::Discarded { id });
        Ok(())
    }

    /// Withdraws an item that is still waiting for delivery. Items being
    /// sent right now cannot be cancelled.
    pub fn cancel(&self, id: QueueItemId) -> ApiResult<QueueItem> {
        let mut state = self.state();
        let item = state
            .active
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        if item.status == QueueItemStatus::InFlight {
            return Err(ApiError::InvalidRequest(format!("queue item {id} is being sent")));
        }

        self.store.apply_batch(
            self.ns(),
            &[
                KvOp::delete(QueueItem::store_key(id)),
                KvOp::set(INDEX_KEY, state.index_json_without(id)?),
            ],
        )?;
        state.active.remove(&id);
        drop(state);

        info!("Queue item {} ({} {}) cancelled", id, item.method, item.endpoint);
        self.emit(QueueEvent::Cancelled { id });
        Ok(item)
    }

    // ── Pausing ──────────────────────────────────────────────────

    /// Stops draining after the item currently in flight.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Outbound queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Outbound queue resumed");
            self.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_halted(&self) -> bool {
        self.is_paused() || self.offline.load(Ordering::SeqCst)
    }

    /// Requests a drain pass from the background loop.
    pub fn drain_now(&self) {
        self.wake.notify_one();
    }

    // ── Draining ─────────────────────────────────────────────────

    fn backoff(&self, attempts: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.config.retry_delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.config.retry_max_delay_ms as i64))
    }

    /// Runtime instant at which the head item's backoff runs out.
    fn head_retry_instant(&self) -> Option<Instant> {
        let due = self.head()?.next_attempt_at?;
        let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Some(Instant::now() + wait)
    }

    fn head(&self) -> Option<QueueItem> {
        self.state().active.values().next().cloned()
    }

    /// Stores a new state for an active item. Returns `false`, writing
    /// nothing, when the item was cancelled in the meantime.
    fn persist_active(&self, item: &QueueItem) -> ApiResult<bool> {
        let mut state = self.state();
        if !state.active.contains_key(&item.id) {
            return Ok(false);
        }
        self.store.set(
            self.ns(),
            &QueueItem::store_key(item.id),
            &serde_json::to_string(item)?,
        )?;
        state.active.insert(item.id, item.clone());
        Ok(true)
    }

    fn remove_delivered(&self, id: QueueItemId) -> ApiResult<()> {
        let mut state = self.state();
        self.store.apply_batch(
            self.ns(),
            &[
                KvOp::delete(QueueItem::store_key(id)),
                KvOp::set(INDEX_KEY, state.index_json_without(id)?),
            ],
        )?;
        state.active.remove(&id);
        Ok(())
    }

    fn move_to_dead(&self, mut item: QueueItem, reason: String) -> ApiResult<()> {
        item.status = QueueItemStatus::Dead;
        item.next_attempt_at = None;
        item.last_error = Some(reason.clone());

        let mut state = self.state();
        self.store.apply_batch(
            self.ns(),
            &[
                KvOp::set(QueueItem::store_key(item.id), serde_json::to_string(&item)?),
                KvOp::set(INDEX_KEY, state.index_json_without(item.id)?),
            ],
        )?;
        let id = item.id;
        warn!(
            "Queue item {} ({} {}) dead-lettered after {} attempt(s): {}",
            id, item.method, item.endpoint, item.attempt_count, reason
        );
        state.active.remove(&id);
        state.dead.insert(id, item);
        drop(state);

        self.emit(QueueEvent::DeadLettered { id, reason });
        Ok(())
    }

    /// Attempts delivery of the queue in FIFO order until it is empty, the
    /// head has to back off, or the queue is paused.
    pub async fn drain(&self, sender: &dyn RequestSender) -> ApiResult<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            if self.is_halted() {
                report.interrupted = true;
                break;
            }
            let Some(mut item) = self.head() else {
                break;
            };
            if !item.is_due(Utc::now()) {
                report.waiting_on = Some(item.id);
                break;
            }

            item.status = QueueItemStatus::InFlight;
            if !self.persist_active(&item)? {
                continue;
            }
            debug!("Replaying queue item {}: {} {}", item.id, item.method, item.endpoint);

            match sender.send(&item.request()).await {
                Ok(_) => {
                    self.remove_delivered(item.id)?;
                    info!("Queue item {} delivered", item.id);
                    report.delivered.push(item.id);
                    self.emit(QueueEvent::Delivered { id: item.id });
                }
                Err(e) if e.is_retryable() => {
                    item.attempt_count += 1;
                    if item.attempt_count >= self.config.max_attempts {
                        report.dead_lettered.push(item.id);
                        self.move_to_dead(item, format!("retries exhausted: {e}"))?;
                        continue;
                    }
                    let retry_at = Utc::now() + self.backoff(item.attempt_count);
                    item.status = QueueItemStatus::Failed;
                    item.next_attempt_at = Some(retry_at);
                    item.last_error = Some(e.to_string());
                    self.persist_active(&item)?;
                    warn!(
                        "Queue item {} failed (attempt {}/{}), retrying at {}: {}",
                        item.id, item.attempt_count, self.config.max_attempts, retry_at, e
                    );
                    report.rescheduled = Some(item.id);
                    self.emit(QueueEvent::Rescheduled {
                        id: item.id,
                        attempt: item.attempt_count,
                        retry_at,
                    });
                    break;
                }
                Err(e) => {
                    item.attempt_count += 1;
                    report.dead_lettered.push(item.id);
                    self.move_to_dead(item, e.to_string())?;
                }
            }
        }

        report.remaining = self.pending_count();
        Ok(report)
    }

    /// Spawns the background drain loop.
    ///
    /// The loop drains when connectivity is restored, when woken by
    /// [`OutboundQueue::drain_now`] or a new item, and on the configured
    /// interval while online. Going offline interrupts a running pass after
    /// the item in flight.
    pub fn spawn_drain_loop(
        self: &Arc<Self>,
        sender: Arc<dyn RequestSender>,
        connectivity: Connectivity,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut online_rx = connectivity.subscribe();
            queue
                .offline
                .store(!*online_rx.borrow_and_update(), Ordering::SeqCst);

            let mut ticker = tokio::time::interval(queue.config.drain_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Set while the head item is backing off.
            let mut retry_at: Option<Instant> = None;

            loop {
                tokio::select! {
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            debug!("Connectivity source dropped, stopping drain loop");
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        queue.offline.store(!online, Ordering::SeqCst);
                        if !online {
                            continue;
                        }
                    }
                    _ = ticker.tick() => {}
                    _ = queue.wake.notified() => {}
                    _ = retry_due(retry_at) => {}
                }
                retry_at = None;

                if queue.is_halted() || queue.pending_count() == 0 {
                    continue;
                }

                let pass = queue.drain(sender.as_ref());
                tokio::pin!(pass);
                let result = loop {
                    tokio::select! {
                        result = &mut pass => break result,
                        changed = online_rx.changed() => {
                            if changed.is_err() {
                                break (&mut pass).await;
                            }
                            let online = *online_rx.borrow_and_update();
                            queue.offline.store(!online, Ordering::SeqCst);
                        }
                    }
                };

                match result {
                    Ok(report) => {
                        if report.rescheduled.is_some() || report.waiting_on.is_some() {
                            retry_at = queue.head_retry_instant();
                        }
                        if !report.delivered.is_empty() || !report.dead_lettered.is_empty() {
                            info!(
                                "Drain pass: {} delivered, {} dead-lettered, {} remaining",
                                report.delivered.len(),
                                report.dead_lettered.len(),
                                report.remaining
                            );
                        }
                    }
                    Err(e) => warn!("Drain pass failed: {}", e),
                }
            }
        })
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
