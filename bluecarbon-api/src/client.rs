//! HTTP request client.
//!
//! Every logical request gets one `X-Request-ID` that is reused across its
//! retries. Reads go through a short-lived cache; writes invalidate the
//! cached entries of their resource family. Network failures, timeouts and
//! 5xx responses are retried with exponential backoff; 4xx responses are
//! returned immediately. While offline, mutations are redirected into the
//! outbound queue and reads are served from the cache when possible.

use crate::cache::ResponseCache;
use crate::config::{ApiConfig, RequestOptions};
use crate::connectivity::Connectivity;
use crate::error::{ApiError, ApiResult};
use crate::outbox::OutboundQueue;
use crate::request::{ApiRequest, HttpMethod};
use async_trait::async_trait;
use bluecarbon_types::{QueueItemId, RequestId};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

const HEALTH_ENDPOINT: &str = "/health";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY: usize = 512;

/// Sends a single request attempt. Implemented by [`ApiClient`]; the
/// outbound queue drains through this seam so tests can substitute it.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> ApiResult<Value>;
}

/// Result of a request that may have been deferred.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// The server answered; `Null` for an empty body.
    Data(Value),
    /// The mutation was persisted to the outbound queue.
    Queued(QueueItemId),
}

impl ApiResponse {
    pub fn is_queued(&self) -> bool {
        matches!(self, ApiResponse::Queued(_))
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ApiResponse::Data(v) => Some(v),
            ApiResponse::Queued(_) => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            ApiResponse::Data(v) => Some(v),
            ApiResponse::Queued(_) => None,
        }
    }
}

/// Snapshot of client state for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    pub base_url: String,
    pub online: bool,
    pub cache_entries: usize,
    pub queue_pending: usize,
    pub dead_letters: usize,
    pub requests_sent: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub queued: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests_sent: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    queued: AtomicU64,
}

/// HTTP client for the backend API.
pub struct ApiClient {
    config: ApiConfig,
    http: Client,
    cache: Mutex<ResponseCache>,
    connectivity: Connectivity,
    queue: Option<Arc<OutboundQueue>>,
    counters: Counters,
}

impl ApiClient {
    /// Creates a client without an outbound queue. Offline mutations fail
    /// with [`ApiError::Offline`].
    pub fn new(config: ApiConfig, connectivity: Connectivity) -> ApiResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ApiError::Config(format!("failed to create HTTP client: {e}")))?;
        let cache = ResponseCache::new(config.cache_ttl());

        Ok(Self {
            config,
            http,
            cache: Mutex::new(cache),
            connectivity,
            queue: None,
            counters: Counters::default(),
        })
    }

    /// Attaches the outbound queue used for offline mutations.
    pub fn with_queue(mut self, queue: Arc<OutboundQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn queue(&self) -> Option<&Arc<OutboundQueue>> {
        self.queue.as_ref()
    }

    fn cache(&self) -> MutexGuard<'_, ResponseCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    // ── Convenience verbs ────────────────────────────────────────

    pub async fn get(&self, endpoint: &str) -> ApiResult<Value> {
        self.get_with(endpoint, &RequestOptions::default()).await
    }

    pub async fn get_with(&self, endpoint: &str, opts: &RequestOptions) -> ApiResult<Value> {
        match self.request(ApiRequest::get(endpoint), opts).await? {
            ApiResponse::Data(v) => Ok(v),
            ApiResponse::Queued(id) => Err(ApiError::InvalidRequest(format!(
                "read unexpectedly queued as {id}"
            ))),
        }
    }

    /// GET and deserialize.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> ApiResult<T> {
        let value = self.get(endpoint).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> ApiResult<ApiResponse> {
        self.request(ApiRequest::post(endpoint, body), &RequestOptions::default())
            .await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> ApiResult<ApiResponse> {
        self.request(ApiRequest::put(endpoint, body), &RequestOptions::default())
            .await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> ApiResult<ApiResponse> {
        self.request(ApiRequest::patch(endpoint, body), &RequestOptions::default())
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResult<ApiResponse> {
        self.request(ApiRequest::delete(endpoint), &RequestOptions::default())
            .await
    }

    // ── Core request path ────────────────────────────────────────

    /// Executes a request with caching, retries and offline handling.
    pub async fn request(
        &self,
        request: ApiRequest,
        opts: &RequestOptions,
    ) -> ApiResult<ApiResponse> {
        request.validate()?;
        let is_read = request.method == HttpMethod::Get;

        if is_read && !opts.bypass_cache {
            if let Some(hit) = self.cache().get(&request.endpoint) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", request.endpoint);
                return Ok(ApiResponse::Data(hit));
            }
        }

        if !self.connectivity.is_online() {
            return self.handle_offline(request, opts);
        }

        let request_id = RequestId::new();
        match self.send_with_retries(&request, &request_id, opts).await {
            Ok(value) => {
                if is_read {
                    if !opts.bypass_cache {
                        self.cache()
                            .insert(request.endpoint.clone(), value.clone(), opts.cache_ttl);
                    }
                } else {
                    let dropped = self.cache().invalidate_family(&request.endpoint);
                    if dropped > 0 {
                        debug!("Invalidated {} cached response(s) after {}", dropped, request.endpoint);
                    }
                }
                Ok(ApiResponse::Data(value))
            }
            Err(e)
                if e.is_retryable()
                    && request.method.is_mutation()
                    && opts.queue_when_offline
                    && self.config.queue_mutations_on_failure =>
            {
                match &self.queue {
                    Some(queue) => {
                        let id = queue.enqueue_failed(request, &e)?;
                        self.counters.queued.fetch_add(1, Ordering::Relaxed);
                        Ok(ApiResponse::Queued(id))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn handle_offline(&self, request: ApiRequest, opts: &RequestOptions) -> ApiResult<ApiResponse> {
        if !request.method.is_mutation() {
            return Err(ApiError::Offline(request.endpoint));
        }
        match (&self.queue, opts.queue_when_offline) {
            (Some(queue), true) => {
                let id = queue.enqueue(request)?;
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(ApiResponse::Queued(id))
            }
            _ => Err(ApiError::Offline(request.endpoint)),
        }
    }

    async fn send_with_retries(
        &self,
        request: &ApiRequest,
        request_id: &RequestId,
        opts: &RequestOptions,
    ) -> ApiResult<Value> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_once(request, request_id, opts).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "{} {} failed (attempt {}/{}, request {}), retrying in {:?}: {}",
                        request.method, request.endpoint, attempt, max_attempts, request_id, delay, e
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    if !self.connectivity.is_online() {
                        debug!("Went offline while retrying {}", request.endpoint);
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        request_id: &RequestId,
        opts: &RequestOptions,
    ) -> ApiResult<Value> {
        let mut builder = self
            .http
            .request(request.method.to_reqwest(), self.url(&request.endpoint))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(timeout) = opts.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &opts.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let mut message = String::from_utf8_lossy(&bytes).into_owned();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    // ── Diagnostics ──────────────────────────────────────────────

    /// Checks `GET /health` once with a short timeout.
    pub async fn health_check(&self) -> bool {
        let result = self
            .http
            .get(self.url(HEALTH_ENDPOINT))
            .header(REQUEST_ID_HEADER, RequestId::new().to_string())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("Health check returned {}", resp.status());
                false
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
                false
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
        info!("Response cache cleared");
    }

    pub fn stats(&self) -> ClientStats {
        let cache_entries = {
            let mut cache = self.cache();
            cache.purge_expired();
            cache.len()
        };
        let (queue_pending, dead_letters) = self
            .queue
            .as_ref()
            .map_or((0, 0), |q| (q.pending_count(), q.dead_letters().len()));

        ClientStats {
            base_url: self.config.base_url.clone(),
            online: self.connectivity.is_online(),
            cache_entries,
            queue_pending,
            dead_letters,
            requests_sent: self.counters.requests_sent.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RequestSender for ApiClient {
    /// One attempt, no cache lookup and no offline redirect. A successful
    /// mutation still invalidates its cache family.
    async fn send(&self, request: &ApiRequest) -> ApiResult<Value> {
        request.validate()?;
        let value = self
            .send_once(request, &RequestId::new(), &RequestOptions::default())
            .await?;
        if request.method.is_mutation() {
            self.cache().invalidate_family(&request.endpoint);
        }
        Ok(value)
    }
}
