//! Polling mechanism.
//!
//! Every interval each subscribed topic is read through the request client
//! (cache bypassed) and delivered as a `bulk_update` snapshot. A round in
//! which every read fails counts as a failed tick; enough consecutive failed
//! ticks end the connection so the reconnect controller can take over.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{WireMessage, snapshot_rows};
use crate::transport::{Connector, EndpointConfig, LiveConnection, Mechanism};
use async_trait::async_trait;
use bluecarbon_api::{ApiClient, RequestOptions};
use bluecarbon_types::Topic;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const POLL_BUFFER: usize = 64;

/// Starts polling sessions.
pub struct PollConnector {
    api: Arc<ApiClient>,
    endpoints: EndpointConfig,
}

impl PollConnector {
    pub fn new(api: Arc<ApiClient>, endpoints: EndpointConfig) -> Self {
        Self { api, endpoints }
    }
}

#[async_trait]
impl Connector for PollConnector {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Poll
    }

    /// Succeeds when the backend answers its health check.
    async fn connect(&self, topics: &[Topic]) -> SyncResult<Box<dyn LiveConnection>> {
        if !self.api.health_check().await {
            return Err(SyncError::Network("backend health check failed".to_string()));
        }
        debug!("Polling started for {} topic(s)", topics.len());

        let (topics_tx, topics_rx) = watch::channel(topics.to_vec());
        let (tx, rx) = mpsc::channel(POLL_BUFFER);
        let task = tokio::spawn(run_poller(
            Arc::clone(&self.api),
            self.endpoints.clone(),
            topics_rx,
            tx,
        ));

        Ok(Box::new(PollConnection {
            topics: topics_tx,
            rx,
            task,
        }))
    }
}

/// Live polling session. Rounds run in their own task, so dropping a
/// pending [`LiveConnection::next_message`] never loses a round.
struct PollConnection {
    topics: watch::Sender<Vec<Topic>>,
    rx: mpsc::Receiver<SyncResult<WireMessage>>,
    task: JoinHandle<()>,
}

impl Drop for PollConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_poller(
    api: Arc<ApiClient>,
    endpoints: EndpointConfig,
    topics: watch::Receiver<Vec<Topic>>,
    tx: mpsc::Sender<SyncResult<WireMessage>>,
) {
    let mut ticker = tokio::time::interval(endpoints.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let threshold = endpoints.poll_failure_threshold.max(1);
    let mut failed_ticks = 0u32;

    loop {
        ticker.tick().await;
        let round = topics.borrow().clone();
        let (messages, ok) = poll_round(&api, &endpoints, &round).await;
        for msg in messages {
            if tx.send(Ok(msg)).await.is_err() {
                return;
            }
        }
        if ok {
            failed_ticks = 0;
            continue;
        }
        failed_ticks += 1;
        if failed_ticks >= threshold {
            let err = SyncError::Network(format!("{failed_ticks} consecutive poll rounds failed"));
            let _ = tx.send(Err(err)).await;
            return;
        }
    }
}

/// Reads every topic once. The flag is whether at least one read succeeded
/// (a round with no topics counts as a success).
async fn poll_round(
    api: &ApiClient,
    endpoints: &EndpointConfig,
    topics: &[Topic],
) -> (Vec<WireMessage>, bool) {
    if topics.is_empty() {
        return (Vec::new(), true);
    }
    let opts = RequestOptions::default().bypass_cache();
    let mut messages = Vec::with_capacity(topics.len());
    let mut any_ok = false;
    for topic in topics {
        let path = endpoints.poll_path_for(topic);
        match api.get_with(&path, &opts).await {
            Ok(body) => {
                any_ok = true;
                match snapshot_rows(topic, &body) {
                    Some(rows) => messages.push(WireMessage::new(
                        "bulk_update",
                        Some(topic.as_str()),
                        Value::Array(rows),
                    )),
                    None => warn!("Poll of {} returned no row array", path),
                }
            }
            Err(e) => warn!("Poll of {} failed: {}", path, e),
        }
    }
    (messages, any_ok)
}

#[async_trait]
impl LiveConnection for PollConnection {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Poll
    }

    async fn subscribe(&mut self, topic: &Topic) -> SyncResult<()> {
        self.topics.send_if_modified(|topics| {
            if topics.contains(topic) {
                false
            } else {
                topics.push(topic.clone());
                true
            }
        });
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> SyncResult<()> {
        self.topics.send_if_modified(|topics| {
            let before = topics.len();
            topics.retain(|t| t != topic);
            topics.len() != before
        });
        Ok(())
    }

    async fn next_message(&mut self) -> Option<SyncResult<WireMessage>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.task.abort();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
