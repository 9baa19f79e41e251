//! The `SyncClient` facade.
//!
//! Wires the request client, outbound queue, transport manager and merge
//! engine together and runs the background tasks:
//! - the transport task (see [`crate::manager`])
//! - the merge task, sole writer of the entity tables
//! - the queue drain loop

use crate::error::SyncResult;
use crate::manager::TransportManager;
use crate::merge::{ApplyOutcome, EntityTable, MergeConfig, MergeEngine, TableView};
use crate::poll::PollConnector;
use crate::protocol::{InboundUpdate, UpdateOp};
use crate::reconnect::{ConnectionState, ReconnectConfig};
use crate::socket::SocketConnector;
use crate::stream::StreamConnector;
use crate::subscription::SubscriptionHandle;
use crate::transport::{Connector, EndpointConfig, Mechanism};
use bluecarbon_api::{ApiClient, ApiConfig, Connectivity, OutboundQueue, QueueConfig, RequestSender};
use bluecarbon_storage::KvStore;
use bluecarbon_types::Topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Configuration for the whole sync layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub reconnect: ReconnectConfig,
    pub endpoints: EndpointConfig,
    pub merge: MergeConfig,
}

/// Published after the merge engine changed a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicChange {
    pub topic: Topic,
    pub op: UpdateOp,
    pub outcome: ApplyOutcome,
}

/// Handle to a running sync layer.
pub struct SyncClient {
    api: Arc<ApiClient>,
    queue: Arc<OutboundQueue>,
    connectivity: Connectivity,
    transport: TransportManager,
    view: TableView,
    last_update: Arc<RwLock<Option<DateTime<Utc>>>>,
    changes: broadcast::Sender<TopicChange>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Opens the queue in `store` and starts the sync layer with the
    /// connectors selected by `config.endpoints.mechanisms`. Must be called
    /// inside a Tokio runtime.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn KvStore>,
        connectivity: Connectivity,
    ) -> SyncResult<Self> {
        let queue = Arc::new(OutboundQueue::open(store, config.queue.clone())?);
        let api = Arc::new(
            ApiClient::new(config.api.clone(), connectivity.clone())?.with_queue(Arc::clone(&queue)),
        );
        let connectors = Self::default_connectors(&config, &api)?;
        Self::with_connectors(&config, api, queue, connectivity, connectors)
    }

    /// Builds the real connectors in configured order.
    pub fn default_connectors(
        config: &SyncConfig,
        api: &Arc<ApiClient>,
    ) -> SyncResult<Vec<Arc<dyn Connector>>> {
        let endpoints = &config.endpoints;
        let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
        for mechanism in &endpoints.mechanisms {
            let connector: Arc<dyn Connector> = match mechanism {
                Mechanism::Socket => Arc::new(SocketConnector::new(
                    endpoints.socket_url.clone(),
                    config.api.bearer_token.clone(),
                )),
                Mechanism::Stream => Arc::new(StreamConnector::new(
                    endpoints.stream_url.clone(),
                    endpoints.subscription_path.clone(),
                    Arc::clone(api),
                    config.reconnect.connect_timeout(),
                )?),
                Mechanism::Poll => Arc::new(PollConnector::new(Arc::clone(api), endpoints.clone())),
            };
            connectors.push(connector);
        }
        Ok(connectors)
    }

    /// Starts the sync layer over caller-supplied connectors.
    pub fn with_connectors(
        config: &SyncConfig,
        api: Arc<ApiClient>,
        queue: Arc<OutboundQueue>,
        connectivity: Connectivity,
        connectors: Vec<Arc<dyn Connector>>,
    ) -> SyncResult<Self> {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let transport = TransportManager::spawn(
            connectors,
            config.reconnect.clone(),
            connectivity.clone(),
            update_tx,
        )?;

        let engine = MergeEngine::new(config.merge.clone());
        let view = engine.view();
        let last_update = Arc::new(RwLock::new(None));
        let (changes, _) = broadcast::channel(256);

        let merge_task = tokio::spawn(run_merge(
            engine,
            update_rx,
            Arc::clone(&last_update),
            changes.clone(),
        ));
        let sender: Arc<dyn RequestSender> = api.clone();
        let drain_task = queue.spawn_drain_loop(sender, connectivity.clone());

        info!(
            "Sync client started against {} ({} queued)",
            api.config().base_url,
            queue.pending_count()
        );

        Ok(Self {
            api,
            queue,
            connectivity,
            transport,
            view,
            last_update,
            changes,
            tasks: vec![merge_task, drain_task],
        })
    }

    pub fn connect(&self) {
        self.transport.connect();
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Restarts reconnecting after automatic retries were suspended.
    pub fn resume(&self) {
        self.transport.resume();
    }

    pub fn subscribe(&self, topic: &str) -> SyncResult<SubscriptionHandle> {
        let topic = Topic::new(topic)?;
        Ok(self.transport.subscribe(topic))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.transport.unsubscribe(handle);
    }

    pub fn subscriptions(&self) -> Vec<Topic> {
        self.transport.subscriptions()
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state_changes()
    }

    /// Receives one event per table change.
    pub fn changes(&self) -> broadcast::Receiver<TopicChange> {
        self.changes.subscribe()
    }

    pub fn table(&self, topic: &str) -> Option<Arc<EntityTable>> {
        self.view.table(topic)
    }

    pub fn rows(&self, topic: &str) -> Vec<Value> {
        self.view.rows(topic)
    }

    /// Topics that have received data.
    pub fn topics(&self) -> Vec<Topic> {
        self.view.topics()
    }

    pub fn view(&self) -> TableView {
        self.view.clone()
    }

    /// Wall-clock time of the last inbound update handed to the merge engine.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update.read().ok().and_then(|t| *t)
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Reports a host connectivity change.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Disconnects and stops every background task.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
        info!("Sync client stopped");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_merge(
    mut engine: MergeEngine,
    mut updates: mpsc::UnboundedReceiver<InboundUpdate>,
    last_update: Arc<RwLock<Option<DateTime<Utc>>>>,
    changes: broadcast::Sender<TopicChange>,
) {
    while let Some(update) = updates.recv().await {
        let outcome = engine.apply(&update);
        {
            let mut last = last_update.write().unwrap_or_else(|p| p.into_inner());
            *last = Some(Utc::now());
        }
        if outcome.changed() {
            let _ = changes.send(TopicChange {
                topic: update.topic,
                op: update.op,
                outcome,
            });
        }
    }
    debug!("Merge task stopped");
}
