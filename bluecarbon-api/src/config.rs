//! Client configuration and per-request options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for [`crate::ApiClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Backend base URL, without a trailing slash.
    pub base_url: String,
    /// Per-attempt request timeout (ms).
    pub timeout_ms: u64,
    /// Total attempts for a retryable failure, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry (ms).
    pub retry_base_delay_ms: u64,
    /// Growth factor between retries.
    pub backoff_multiplier: u32,
    /// Lifetime of cached read responses (ms).
    pub cache_ttl_ms: u64,
    /// Bearer token sent in the `Authorization` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Enqueue mutations that exhaust their retries with a retryable error.
    pub queue_mutations_on_failure: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout_ms: 30_000,
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            backoff_multiplier: 2,
            cache_ttl_ms: 5 * 60 * 1_000,
            bearer_token: None,
            queue_mutations_on_failure: true,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Delay before retry number `attempt` (1-based): `base * multiplier^(attempt-1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier.max(1))
            .saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

/// Per-request switches.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Skip the read cache entirely (no lookup, no store).
    pub bypass_cache: bool,
    /// Redirect mutations into the outbound queue while offline.
    pub queue_when_offline: bool,
    /// Override the configured cache lifetime for this read.
    pub cache_ttl: Option<Duration>,
    /// Override the configured per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            bypass_cache: false,
            queue_when_offline: true,
            cache_ttl: None,
            timeout: None,
            headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn no_queue(mut self) -> Self {
        self.queue_when_offline = false;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
