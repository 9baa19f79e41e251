//! Server-push stream mechanism (server-sent events).
//!
//! The stream is inbound only, so subscriptions are registered with a
//! separate request to the subscription path before the stream is opened,
//! and again for every topic added while it is open.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ControlFrame, WireMessage};
use crate::transport::{Connector, LiveConnection, Mechanism};
use async_trait::async_trait;
use bluecarbon_api::{ApiClient, ApiRequest, RequestOptions};
use bluecarbon_types::Topic;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Incremental parser for the `text/event-stream` format.
///
/// Only `data:` and `event:` fields are used. An event named by `event:`
/// whose data has no `type` gets the event name as its type.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes, returning the payloads of every completed event.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<(Option<String>, String)> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<(Option<String>, String)> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some((event, data));
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

fn to_wire(event: Option<String>, data: &str) -> SyncResult<WireMessage> {
    let mut value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| SyncError::Protocol(format!("malformed stream event: {e}")))?;
    if let (Some(name), Some(obj)) = (event, value.as_object_mut()) {
        if !obj.contains_key("type") && name != "message" {
            obj.insert("type".to_string(), serde_json::Value::String(name));
        }
    }
    serde_json::from_value(value).map_err(|e| SyncError::Protocol(format!("malformed stream event: {e}")))
}

/// Connects to the server-push stream endpoint.
pub struct StreamConnector {
    url: String,
    subscription_path: String,
    api: Arc<ApiClient>,
    http: Client,
}

impl StreamConnector {
    pub fn new(
        url: impl Into<String>,
        subscription_path: impl Into<String>,
        api: Arc<ApiClient>,
        connect_timeout: Duration,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            subscription_path: subscription_path.into(),
            api,
            http,
        })
    }
}

async fn register(api: &ApiClient, path: &str, frame: ControlFrame) -> SyncResult<()> {
    let body = serde_json::to_value(&frame)?;
    let opts = RequestOptions::default().no_queue();
    api.request(ApiRequest::post(path, body), &opts).await?;
    Ok(())
}

#[async_trait]
impl Connector for StreamConnector {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Stream
    }

    async fn connect(&self, topics: &[Topic]) -> SyncResult<Box<dyn LiveConnection>> {
        for topic in topics {
            register(&self.api, &self.subscription_path, ControlFrame::subscribe(topic.clone())).await?;
        }

        let mut request = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.api.config().bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("stream connect to {} failed: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Network(format!(
                "stream endpoint {} returned {}",
                self.url, status
            )));
        }
        info!("Stream connected to {}", self.url);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(Box::new(StreamConnection {
            body: Some(body),
            parser: SseParser::new(),
            pending: VecDeque::new(),
            api: Arc::clone(&self.api),
            subscription_path: self.subscription_path.clone(),
        }))
    }
}

struct StreamConnection {
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    parser: SseParser,
    pending: VecDeque<(Option<String>, String)>,
    api: Arc<ApiClient>,
    subscription_path: String,
}

#[async_trait]
impl LiveConnection for StreamConnection {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Stream
    }

    async fn subscribe(&mut self, topic: &Topic) -> SyncResult<()> {
        debug!("Stream subscribe {}", topic);
        register(&self.api, &self.subscription_path, ControlFrame::subscribe(topic.clone())).await
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> SyncResult<()> {
        debug!("Stream unsubscribe {}", topic);
        register(&self.api, &self.subscription_path, ControlFrame::unsubscribe(topic.clone())).await
    }

    async fn next_message(&mut self) -> Option<SyncResult<WireMessage>> {
        loop {
            if let Some((event, data)) = self.pending.pop_front() {
                return Some(to_wire(event, &data));
            }
            let body = self.body.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.parser.feed(&chunk)),
                Some(Err(e)) => {
                    warn!("Stream error: {}", e);
                    self.body = None;
                    return Some(Err(SyncError::Network(e.to_string())));
                }
                None => {
                    debug!("Stream ended by server");
                    self.body = None;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        self.body = None;
        self.pending.clear();
    }
}
