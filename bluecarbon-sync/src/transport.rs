//! Transport layer abstraction.
//!
//! A [`Connector`] knows how to establish one kind of live-update
//! connection ([`Mechanism`]); a [`LiveConnection`] is the established link.
//! The transport manager owns at most one connection at a time and only ever
//! talks to it through these traits, so the socket, stream and polling
//! mechanisms (and the scripted [`mock`] used in tests) are interchangeable.

use crate::error::SyncResult;
use crate::protocol::WireMessage;
use async_trait::async_trait;
use bluecarbon_types::Topic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Live-update delivery mechanisms, in capability order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    /// Full-duplex socket push.
    Socket,
    /// Server-push event stream; inbound only.
    Stream,
    /// Periodic reads per subscribed topic.
    Poll,
}

impl Mechanism {
    /// All mechanisms, highest capability first.
    pub const ALL: [Mechanism; 3] = [Mechanism::Socket, Mechanism::Stream, Mechanism::Poll];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Socket => "socket",
            Mechanism::Stream => "stream",
            Mechanism::Poll => "poll",
        }
    }

    /// Whether the connection can carry client-to-server frames.
    pub fn is_duplex(&self) -> bool {
        matches!(self, Mechanism::Socket)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to reach the live-update endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Socket push endpoint.
    pub socket_url: String,
    /// Server-push stream endpoint.
    pub stream_url: String,
    /// Path (relative to the API base URL) that registers stream
    /// subscriptions.
    pub subscription_path: String,
    /// Polling interval (ms).
    pub poll_interval_ms: u64,
    /// Read path per topic; `{topic}` is replaced by the topic name.
    pub poll_path: String,
    /// Consecutive failed poll rounds that count as a lost connection.
    pub poll_failure_threshold: u32,
    /// Mechanisms to use, in the order they are tried.
    pub mechanisms: Vec<Mechanism>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:5000/ws".to_string(),
            stream_url: "http://localhost:5000/sse".to_string(),
            subscription_path: "/api/realtime/subscriptions".to_string(),
            poll_interval_ms: 5_000,
            poll_path: "/api/{topic}".to_string(),
            poll_failure_threshold: 3,
            mechanisms: Mechanism::ALL.to_vec(),
        }
    }
}

impl EndpointConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The read path for one topic.
    pub fn poll_path_for(&self, topic: &Topic) -> String {
        self.poll_path
            .replace("{topic}", &urlencoding::encode(topic.as_str()))
    }
}

/// Establishes connections of one mechanism.
#[async_trait]
pub trait Connector: Send + Sync {
    fn mechanism(&self) -> Mechanism;

    /// Opens a connection already subscribed to `topics`, in order.
    ///
    /// For the socket this means subscribe frames right after the
    /// handshake; for the stream, subscription requests before it opens;
    /// for polling, the initial set of topics to read.
    async fn connect(&self, topics: &[Topic]) -> SyncResult<Box<dyn LiveConnection>>;
}

/// An established live-update connection.
#[async_trait]
pub trait LiveConnection: Send {
    fn mechanism(&self) -> Mechanism;

    /// Adds a topic to this connection.
    async fn subscribe(&mut self, topic: &Topic) -> SyncResult<()>;

    /// Removes a topic from this connection.
    async fn unsubscribe(&mut self, topic: &Topic) -> SyncResult<()>;

    /// Waits for the next inbound message.
    ///
    /// `None` means the remote side closed the connection. An
    /// `Err(SyncError::Protocol)` is a single bad message; any other error
    /// means the connection is unusable.
    async fn next_message(&mut self) -> Option<SyncResult<WireMessage>>;

    /// Closes the connection. Further calls are no-ops.
    async fn close(&mut self);
}

/// Scripted connectors for tests.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use crate::protocol::ControlAction;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Shared record of connection attempts across several connectors.
    #[derive(Debug, Clone, Default)]
    pub struct MockLog(Arc<Mutex<Vec<Mechanism>>>);

    impl MockLog {
        pub fn new() -> Self {
            Self::default()
        }

        /// Mechanisms in the order they were attempted.
        pub fn attempts(&self) -> Vec<Mechanism> {
            self.0.lock().map(|l| l.clone()).unwrap_or_default()
        }

        fn record(&self, mechanism: Mechanism) {
            if let Ok(mut log) = self.0.lock() {
                log.push(mechanism);
            }
        }
    }

    enum Outcome {
        Fail(String),
        Hang,
        Accept(mpsc::UnboundedReceiver<RemoteEvent>),
    }

    enum RemoteEvent {
        Message(WireMessage),
        Raw(SyncResult<WireMessage>),
        Close,
    }

    #[derive(Default)]
    struct Shared {
        script: VecDeque<Outcome>,
        attempts: usize,
        connect_topics: Vec<Vec<Topic>>,
        frames: Vec<(ControlAction, Topic)>,
    }

    /// A connector that follows a script. Unscripted attempts fail.
    #[derive(Clone)]
    pub struct MockConnector {
        mechanism: Mechanism,
        shared: Arc<Mutex<Shared>>,
        log: MockLog,
    }

    impl MockConnector {
        pub fn new(mechanism: Mechanism) -> Self {
            Self::with_log(mechanism, MockLog::new())
        }

        pub fn with_log(mechanism: Mechanism, log: MockLog) -> Self {
            Self {
                mechanism,
                shared: Arc::new(Mutex::new(Shared::default())),
                log,
            }
        }

        fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
            self.shared.lock().unwrap_or_else(|p| p.into_inner())
        }

        /// The next attempt fails with a network error.
        pub fn fail_next(&self, reason: impl Into<String>) {
            self.shared().script.push_back(Outcome::Fail(reason.into()));
        }

        /// The next attempt never completes.
        pub fn hang_next(&self) {
            self.shared().script.push_back(Outcome::Hang);
        }

        /// The next attempt succeeds; the returned handle plays the server.
        pub fn accept_next(&self) -> MockRemote {
            let (tx, rx) = mpsc::unbounded_channel();
            self.shared().script.push_back(Outcome::Accept(rx));
            MockRemote { tx }
        }

        pub fn attempts(&self) -> usize {
            self.shared().attempts
        }

        /// Topics passed to each successful or failed `connect`.
        pub fn connect_topics(&self) -> Vec<Vec<Topic>> {
            self.shared().connect_topics.clone()
        }

        /// Subscribe/unsubscribe calls made on established connections.
        pub fn frames(&self) -> Vec<(ControlAction, Topic)> {
            self.shared().frames.clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn mechanism(&self) -> Mechanism {
            self.mechanism
        }

        async fn connect(&self, topics: &[Topic]) -> SyncResult<Box<dyn LiveConnection>> {
            self.log.record(self.mechanism);
            let outcome = {
                let mut shared = self.shared();
                shared.attempts += 1;
                shared.connect_topics.push(topics.to_vec());
                shared.script.pop_front()
            };
            match outcome {
                Some(Outcome::Accept(rx)) => Ok(Box::new(MockConnection {
                    mechanism: self.mechanism,
                    rx,
                    shared: Arc::clone(&self.shared),
                    closed: false,
                })),
                Some(Outcome::Hang) => std::future::pending().await,
                Some(Outcome::Fail(reason)) => Err(SyncError::Network(reason)),
                None => Err(SyncError::Network(format!("{} unreachable", self.mechanism))),
            }
        }
    }

    /// Server side of an accepted mock connection.
    #[derive(Clone)]
    pub struct MockRemote {
        tx: mpsc::UnboundedSender<RemoteEvent>,
    }

    impl MockRemote {
        pub fn send(&self, message: WireMessage) {
            let _ = self.tx.send(RemoteEvent::Message(message));
        }

        /// Delivers an error from the connection (e.g. a malformed frame).
        pub fn send_error(&self, error: SyncError) {
            let _ = self.tx.send(RemoteEvent::Raw(Err(error)));
        }

        /// Closes the connection from the server side.
        pub fn close(&self) {
            let _ = self.tx.send(RemoteEvent::Close);
        }
    }

    struct MockConnection {
        mechanism: Mechanism,
        rx: mpsc::UnboundedReceiver<RemoteEvent>,
        shared: Arc<Mutex<Shared>>,
        closed: bool,
    }

    impl MockConnection {
        fn record(&self, action: ControlAction, topic: &Topic) {
            if let Ok(mut shared) = self.shared.lock() {
                shared.frames.push((action, topic.clone()));
            }
        }
    }

    #[async_trait]
    impl LiveConnection for MockConnection {
        fn mechanism(&self) -> Mechanism {
            self.mechanism
        }

        async fn subscribe(&mut self, topic: &Topic) -> SyncResult<()> {
            self.record(ControlAction::Subscribe, topic);
            Ok(())
        }

        async fn unsubscribe(&mut self, topic: &Topic) -> SyncResult<()> {
            self.record(ControlAction::Unsubscribe, topic);
            Ok(())
        }

        async fn next_message(&mut self) -> Option<SyncResult<WireMessage>> {
            if self.closed {
                return None;
            }
            match self.rx.recv().await {
                Some(RemoteEvent::Message(msg)) => Some(Ok(msg)),
                Some(RemoteEvent::Raw(result)) => Some(result),
                Some(RemoteEvent::Close) | None => {
                    self.closed = true;
                    None
                }
            }
        }

        async fn close(&mut self) {
            self.closed = true;
            self.rx.close();
        }
    }
}
