//! Transport manager.
//!
//! A single background task owns the active connection, the in-flight
//! connect attempt and the retry timer. The public [`TransportManager`]
//! handle only sends commands and reads the published state, so no call
//! blocks on network I/O.
//!
//! Inbound messages are decoded and forwarded, in arrival order, to the
//! update channel handed to [`TransportManager::spawn`].

use crate::error::{SyncError, SyncResult};
use crate::protocol::{self, InboundUpdate, WireMessage};
use crate::reconnect::{ConnectionState, Decision, ReconnectConfig, ReconnectController};
use crate::subscription::{SubscriptionHandle, SubscriptionRegistry, WireChange};
use crate::transport::{Connector, LiveConnection, Mechanism};
use bluecarbon_api::Connectivity;
use bluecarbon_types::Topic;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type ConnectOutput = (Mechanism, Vec<Topic>, SyncResult<Box<dyn LiveConnection>>);
type ConnectFuture = Pin<Box<dyn Future<Output = ConnectOutput> + Send>>;

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Resume,
    Wire(WireChange),
    Shutdown,
}

fn lock_registry(registry: &Mutex<SubscriptionRegistry>) -> MutexGuard<'_, SubscriptionRegistry> {
    registry.lock().unwrap_or_else(|p| p.into_inner())
}

/// Handle to the transport task.
pub struct TransportManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    /// Starts the transport task. Mechanisms are tried in the order of
    /// `connectors`. Nothing connects until [`TransportManager::connect`].
    pub fn spawn(
        connectors: Vec<Arc<dyn Connector>>,
        config: ReconnectConfig,
        connectivity: Connectivity,
        updates: mpsc::UnboundedSender<InboundUpdate>,
    ) -> SyncResult<Self> {
        let order: Vec<Mechanism> = connectors.iter().map(|c| c.mechanism()).collect();
        let controller = ReconnectController::new(config, order)?;
        let connectors: HashMap<Mechanism, Arc<dyn Connector>> = connectors
            .into_iter()
            .map(|c| (c.mechanism(), c))
            .collect();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));

        let actor = Actor {
            connectors,
            controller,
            registry: Arc::clone(&registry),
            state_tx,
            updates,
            connectivity,
            wanted: false,
            connecting: None,
            active: None,
            retry_at: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Ok(Self {
            commands,
            state,
            registry,
            task: Mutex::new(Some(task)),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Transport task already stopped");
        }
    }

    /// Starts connecting (or keeps the current connection). While offline
    /// the request is remembered and acted on when connectivity returns.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Closes the connection and cancels any attempt or scheduled retry.
    /// Registered subscriptions are kept for the next connect.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Restarts reconnecting after the attempt ceiling was reached.
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Registers interest in a topic.
    pub fn subscribe(&self, topic: Topic) -> SubscriptionHandle {
        let (handle, change) = lock_registry(&self.registry).subscribe(topic);
        if let Some(change) = change {
            self.send(Command::Wire(change));
        }
        handle
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let change = lock_registry(&self.registry).unsubscribe(handle);
        if let Some(change) = change {
            self.send(Command::Wire(change));
        }
    }

    /// Registered topics in registration order.
    pub fn subscriptions(&self) -> Vec<Topic> {
        lock_registry(&self.registry).topics()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Closes the connection and waits for the task to exit.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Active {
    conn: Box<dyn LiveConnection>,
    /// Topics currently subscribed on this connection.
    topics: Vec<Topic>,
}

struct Actor {
    connectors: HashMap<Mechanism, Arc<dyn Connector>>,
    controller: ReconnectController,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    state_tx: watch::Sender<ConnectionState>,
    updates: mpsc::UnboundedSender<InboundUpdate>,
    connectivity: Connectivity,
    /// The host asked to be connected.
    wanted: bool,
    connecting: Option<ConnectFuture>,
    active: Option<Active>,
    retry_at: Option<Instant>,
}

async fn connect_done(slot: &mut Option<ConnectFuture>) -> ConnectOutput {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(slot: &mut Option<Active>) -> Option<SyncResult<WireMessage>> {
    match slot.as_mut() {
        Some(active) => active.conn.next_message().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut online_rx = self.connectivity.subscribe();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.teardown().await;
                        self.controller.reset();
                        self.publish();
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                },
                changed = online_rx.changed() => {
                    if changed.is_ok() {
                        let online = *online_rx.borrow_and_update();
                        self.on_connectivity(online).await;
                    }
                }
                (mechanism, topics, result) = connect_done(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(mechanism, topics, result).await;
                }
                inbound = next_inbound(&mut self.active) => self.on_inbound(inbound).await,
                _ = retry_due(self.retry_at) => {
                    self.retry_at = None;
                    let decision = self.controller.retry();
                    self.act(decision);
                }
            }
        }
        debug!("Transport task stopped");
    }

    fn registered_topics(&self) -> Vec<Topic> {
        lock_registry(&self.registry).topics()
    }

    fn publish(&self) {
        let next = self.controller.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!("Live-update connection {}", next);
        }
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.connecting.is_none()
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.wanted = true;
                if !self.connectivity.is_online() {
                    info!("Offline, connecting once the network is back");
                    return;
                }
                if self.is_idle() && self.retry_at.is_none() && !self.controller.is_suspended() {
                    let decision = self.controller.start();
                    self.act(decision);
                }
            }
            Command::Disconnect => {
                self.wanted = false;
                self.teardown().await;
                self.controller.reset();
                self.publish();
            }
            Command::Resume => {
                if self.wanted && self.connectivity.is_online() && self.is_idle() {
                    self.retry_at = None;
                    let decision = self.controller.resume();
                    self.act(decision);
                }
            }
            Command::Wire(change) => self.on_wire_change(change).await,
            Command::Shutdown => {}
        }
    }

    async fn on_connectivity(&mut self, online: bool) {
        if online {
            if self.wanted && self.is_idle() {
                self.retry_at = None;
                let decision = self.controller.resume();
                self.act(decision);
            }
        } else {
            self.teardown().await;
            self.controller.reset();
            self.publish();
        }
    }

    /// Drops the attempt and the retry timer and closes the connection.
    async fn teardown(&mut self) {
        if self.connecting.take().is_some() {
            debug!("Cancelled in-flight connect");
        }
        self.retry_at = None;
        if let Some(mut active) = self.active.take() {
            active.conn.close().await;
        }
    }

    fn act(&mut self, decision: Decision) {
        let mut decision = decision;
        loop {
            match decision {
                Decision::Try(mechanism) => {
                    let Some(connector) = self.connectors.get(&mechanism).cloned() else {
                        warn!("No connector for {}", mechanism);
                        decision = self.controller.on_failure();
                        continue;
                    };
                    self.controller.on_attempt(mechanism);
                    let topics = self.registered_topics();
                    let timeout = self.controller.config().connect_timeout();
                    debug!("Connecting via {} with {} topic(s)", mechanism, topics.len());
                    self.connecting = Some(Box::pin(async move {
                        let result = match tokio::time::timeout(timeout, connector.connect(&topics)).await {
                            Ok(result) => result,
                            Err(_) => Err(SyncError::Timeout),
                        };
                        (mechanism, topics, result)
                    }));
                }
                Decision::RetryAfter(delay) => {
                    self.retry_at = Some(Instant::now() + delay);
                }
                Decision::Suspend => {
                    self.retry_at = None;
                }
            }
            break;
        }
        self.publish();
    }

    async fn on_connect_result(
        &mut self,
        mechanism: Mechanism,
        sent: Vec<Topic>,
        result: SyncResult<Box<dyn LiveConnection>>,
    ) {
        let mut conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!("{} connect failed: {}", mechanism, e);
                self.fail_over();
                return;
            }
        };

        // Reconcile changes made while the attempt was in flight.
        let current = self.registered_topics();
        let mut reconcile = Ok(());
        for topic in current.iter().filter(|t| !sent.contains(t)) {
            reconcile = conn.subscribe(topic).await;
            if reconcile.is_err() {
                break;
            }
        }
        if reconcile.is_ok() {
            for topic in sent.iter().filter(|t| !current.contains(t)) {
                reconcile = conn.unsubscribe(topic).await;
                if reconcile.is_err() {
                    break;
                }
            }
        }
        if let Err(e) = reconcile {
            warn!("{} subscription replay failed: {}", mechanism, e);
            conn.close().await;
            self.fail_over();
            return;
        }

        info!(
            "Connected via {} ({} subscription(s) replayed)",
            mechanism,
            current.len()
        );
        self.controller.on_connected(mechanism);
        self.active = Some(Active {
            conn,
            topics: current,
        });
        self.publish();
    }

    /// Reports a failure to the controller and follows its decision.
    fn fail_over(&mut self) {
        let decision = self.controller.on_failure();
        self.publish();
        self.act(decision);
    }

    async fn connection_lost(&mut self, reason: &str) {
        if let Some(mut active) = self.active.take() {
            warn!("{} connection lost: {}", active.conn.mechanism(), reason);
            active.conn.close().await;
        }
        self.fail_over();
    }

    async fn on_inbound(&mut self, inbound: Option<SyncResult<WireMessage>>) {
        match inbound {
            Some(Ok(message)) => match protocol::decode(&message) {
                Ok(updates) => {
                    for update in updates {
                        if self.updates.send(update).is_err() {
                            debug!("Update receiver dropped");
                        }
                    }
                }
                Err(e) => warn!("Dropping '{}' message: {}", message.kind, e),
            },
            Some(Err(SyncError::Protocol(e))) => warn!("Dropping malformed message: {}", e),
            Some(Err(e)) => self.connection_lost(&e.to_string()).await,
            None => self.connection_lost("closed by remote").await,
        }
    }

    async fn on_wire_change(&mut self, change: WireChange) {
        let Some(active) = self.active.as_mut() else {
            // Picked up by the replay on the next connection.
            return;
        };
        let result = match change {
            WireChange::Subscribe(topic) => {
                if active.topics.contains(&topic) {
                    Ok(())
                } else {
                    let r = active.conn.subscribe(&topic).await;
                    active.topics.push(topic);
                    r
                }
            }
            WireChange::Unsubscribe(topic) => {
                if active.topics.contains(&topic) {
                    active.topics.retain(|t| *t != topic);
                    active.conn.unsubscribe(&topic).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            self.connection_lost(&format!("subscription change failed: {e}")).await;
        }
    }
}
