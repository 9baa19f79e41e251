use bluecarbon_api::Connectivity;
use bluecarbon_sync::protocol::{ControlAction, InboundUpdate, UpdateOp, WireMessage};
use bluecarbon_sync::transport::mock::{MockConnector, MockLog};
use bluecarbon_sync::{
    ConnectionState, Connector, Mechanism, ReconnectConfig, SyncError, TransportManager,
};
use bluecarbon_types::Topic;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ── Helpers ─────────────────────────────────────────────────────

struct Harness {
    manager: TransportManager,
    socket: MockConnector,
    stream: MockConnector,
    poll: MockConnector,
    log: MockLog,
    updates: mpsc::UnboundedReceiver<InboundUpdate>,
    connectivity: Connectivity,
}

fn harness_with(config: ReconnectConfig, connectivity: Connectivity) -> Harness {
    let log = MockLog::new();
    let socket = MockConnector::with_log(Mechanism::Socket, log.clone());
    let stream = MockConnector::with_log(Mechanism::Stream, log.clone());
    let poll = MockConnector::with_log(Mechanism::Poll, log.clone());
    let connectors: Vec<Arc<dyn Connector>> = vec![
        Arc::new(socket.clone()),
        Arc::new(stream.clone()),
        Arc::new(poll.clone()),
    ];
    let (tx, updates) = mpsc::unbounded_channel();
    let manager = TransportManager::spawn(connectors, config, connectivity.clone(), tx).unwrap();
    Harness {
        manager,
        socket,
        stream,
        poll,
        log,
        updates,
        connectivity,
    }
}

fn harness() -> Harness {
    harness_with(ReconnectConfig::default(), Connectivity::online())
}

fn topic(name: &str) -> Topic {
    Topic::new(name).unwrap()
}

async fn wait_for_state(manager: &TransportManager, expected: ConnectionState) {
    let mut rx = manager.state_changes();
    let reached = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == expected)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "never reached {expected}, stuck at {}",
        manager.state()
    );
}

/// Polls `check` until it holds, letting the paused clock advance.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

// ── Fallback ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn falls_back_from_socket_to_stream() {
    let h = harness();
    let _remote = h.stream.accept_next();

    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Stream)).await;

    assert_eq!(h.log.attempts(), vec![Mechanism::Socket, Mechanism::Stream]);
}

#[tokio::test(start_paused = true)]
async fn lost_stream_degrades_to_poll_without_retrying_socket() {
    let h = harness();
    let stream_remote = h.stream.accept_next();
    let _poll_remote = h.poll.accept_next();

    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Stream)).await;

    stream_remote.close();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Poll)).await;

    assert_eq!(
        h.log.attempts(),
        vec![Mechanism::Socket, Mechanism::Stream, Mechanism::Poll]
    );
    assert_eq!(h.socket.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_cycle_backs_off_then_restarts_at_socket() {
    let h = harness();
    h.socket.fail_next("refused");
    let _remote = h.socket.accept_next();

    let started = Instant::now();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;

    assert_eq!(
        h.log.attempts(),
        vec![
            Mechanism::Socket,
            Mechanism::Stream,
            Mechanism::Poll,
            Mechanism::Socket
        ]
    );
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn hanging_connect_times_out_and_degrades() {
    let h = harness();
    h.socket.hang_next();
    let _remote = h.stream.accept_next();

    let started = Instant::now();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Stream)).await;

    assert!(started.elapsed() >= Duration::from_secs(10));
}

// ── Ceiling ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stops_after_ceiling_until_resumed() {
    let config = ReconnectConfig {
        max_failed_cycles: 2,
        ..ReconnectConfig::default()
    };
    let h = harness_with(config, Connectivity::online());

    h.manager.connect();
    eventually(|| h.log.attempts().len() == 6).await;
    wait_for_state(&h.manager, ConnectionState::Failed).await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.log.attempts().len(), 6);
    assert_eq!(h.poll.attempts(), 2);

    let _remote = h.socket.accept_next();
    h.manager.resume();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;
}

// ── Subscriptions ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn replays_subscriptions_in_registration_order() {
    let h = harness();
    let _p = h.manager.subscribe(topic("projects"));
    let _c = h.manager.subscribe(topic("carbon_credits"));
    let socket_remote = h.socket.accept_next();
    let _stream_remote = h.stream.accept_next();

    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;
    socket_remote.close();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Stream)).await;

    let expected = vec![topic("projects"), topic("carbon_credits")];
    assert_eq!(h.socket.connect_topics(), vec![expected.clone()]);
    assert_eq!(h.stream.connect_topics(), vec![expected]);
}

#[tokio::test(start_paused = true)]
async fn subscription_changes_reach_the_live_connection_once() {
    let h = harness();
    let _remote = h.socket.accept_next();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;

    let a = h.manager.subscribe(topic("field_data"));
    let b = h.manager.subscribe(topic("field_data"));
    eventually(|| h.socket.frames().len() == 1).await;

    h.manager.unsubscribe(&a);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.socket.frames().len(), 1);

    h.manager.unsubscribe(&b);
    eventually(|| h.socket.frames().len() == 2).await;
    assert_eq!(
        h.socket.frames(),
        vec![
            (ControlAction::Subscribe, topic("field_data")),
            (ControlAction::Unsubscribe, topic("field_data")),
        ]
    );
    assert!(h.manager.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn topic_added_while_connecting_is_subscribed_after_connect() {
    let h = harness();
    let _p = h.manager.subscribe(topic("projects"));
    h.socket.hang_next();
    let _remote = h.stream.accept_next();

    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connecting(Mechanism::Socket)).await;
    let _n = h.manager.subscribe(topic("notifications"));

    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Stream)).await;
    assert_eq!(
        h.stream.connect_topics(),
        vec![vec![topic("projects"), topic("notifications")]]
    );
}

// ── Inbound ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn forwards_updates_in_arrival_order() {
    let mut h = harness();
    let remote = h.socket.accept_next();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;

    remote.send(WireMessage::new("create", Some("projects"), json!({"id": 1})));
    remote.send(WireMessage::new("ping", None, json!(null)));
    remote.send(WireMessage::new("update", Some("projects"), json!({"id": 1, "v": 2})));
    remote.send(WireMessage::new("delete", Some("projects"), json!({"id": 1})));

    let mut ops = Vec::new();
    for _ in 0..3 {
        ops.push(h.updates.recv().await.unwrap().op);
    }
    assert_eq!(ops, vec![UpdateOp::Create, UpdateOp::Update, UpdateOp::Delete]);
}

#[tokio::test(start_paused = true)]
async fn malformed_message_does_not_drop_the_connection() {
    let mut h = harness();
    let remote = h.socket.accept_next();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;

    remote.send_error(SyncError::Protocol("garbage".into()));
    remote.send(WireMessage::new("create", None, json!({"id": 1})));
    remote.send(WireMessage::new("create", Some("projects"), json!({"id": 2})));

    let update = h.updates.recv().await.unwrap();
    assert_eq!(update.payload, json!({"id": 2}));
    assert_eq!(h.manager.state(), ConnectionState::Connected(Mechanism::Socket));
    assert_eq!(h.socket.attempts(), 1);
}

// ── Disconnect & connectivity ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_attempt() {
    let h = harness();
    h.socket.hang_next();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connecting(Mechanism::Socket)).await;

    h.manager.disconnect();
    wait_for_state(&h.manager, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.log.attempts(), vec![Mechanism::Socket]);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn going_offline_closes_and_coming_back_reconnects() {
    let h = harness();
    let _first = h.socket.accept_next();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;

    h.connectivity.set_online(false);
    wait_for_state(&h.manager, ConnectionState::Disconnected).await;

    let _second = h.socket.accept_next();
    h.connectivity.set_online(true);
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;
    assert_eq!(h.socket.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_while_offline_waits_for_network() {
    let h = harness_with(ReconnectConfig::default(), Connectivity::offline());
    let _remote = h.socket.accept_next();

    h.manager.connect();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.log.attempts().is_empty());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);

    h.connectivity.set_online(true);
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_task() {
    let h = harness();
    let _remote = h.socket.accept_next();
    h.manager.connect();
    wait_for_state(&h.manager, ConnectionState::Connected(Mechanism::Socket)).await;

    h.manager.shutdown().await;
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}
