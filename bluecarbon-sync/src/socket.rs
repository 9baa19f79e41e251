//! Socket push mechanism (WebSocket).

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ControlFrame, WireMessage};
use crate::transport::{Connector, LiveConnection, Mechanism};
use async_trait::async_trait;
use bluecarbon_types::Topic;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the socket push endpoint.
pub struct SocketConnector {
    url: String,
    bearer_token: Option<String>,
}

impl SocketConnector {
    pub fn new(url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token,
        }
    }
}

#[async_trait]
impl Connector for SocketConnector {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Socket
    }

    async fn connect(&self, topics: &[Topic]) -> SyncResult<Box<dyn LiveConnection>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Config(format!("invalid socket URL {}: {e}", self.url)))?;
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::Config(format!("invalid bearer token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| SyncError::Network(format!("socket connect to {} failed: {e}", self.url)))?;
        info!("Socket connected to {}", self.url);

        let mut conn = SocketConnection {
            socket,
            closed: false,
        };
        for topic in topics {
            conn.subscribe(topic).await?;
        }
        Ok(Box::new(conn))
    }
}

struct SocketConnection {
    socket: Socket,
    closed: bool,
}

impl SocketConnection {
    async fn send_frame(&mut self, frame: ControlFrame) -> SyncResult<()> {
        let text = frame.to_json()?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| SyncError::Network(format!("socket send failed: {e}")))
    }
}

#[async_trait]
impl LiveConnection for SocketConnection {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Socket
    }

    async fn subscribe(&mut self, topic: &Topic) -> SyncResult<()> {
        debug!("Socket subscribe {}", topic);
        self.send_frame(ControlFrame::subscribe(topic.clone())).await
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> SyncResult<()> {
        debug!("Socket unsubscribe {}", topic);
        self.send_frame(ControlFrame::unsubscribe(topic.clone())).await
    }

    async fn next_message(&mut self) -> Option<SyncResult<WireMessage>> {
        if self.closed {
            return None;
        }
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Some(WireMessage::parse(&text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(match std::str::from_utf8(&bytes) {
                        Ok(text) => WireMessage::parse(text),
                        Err(e) => Err(SyncError::Protocol(format!("binary frame is not UTF-8: {e}"))),
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Socket closed by server: {:?}", frame);
                    self.closed = true;
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Socket error: {}", e);
                    self.closed = true;
                    return Some(Err(SyncError::Network(e.to_string())));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.socket.close(None).await;
        }
    }
}
