use bluecarbon_api::{
    ApiClient, ApiConfig, ApiError, ApiRequest, ApiResponse, Connectivity, OutboundQueue,
    QueueConfig, REQUEST_ID_HEADER, RequestOptions,
};
use bluecarbon_storage::MemoryStore;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server: &MockServer) -> ApiConfig {
    ApiConfig {
        base_url: server.uri(),
        timeout_ms: 2_000,
        max_attempts: 3,
        retry_base_delay_ms: 10,
        ..Default::default()
    }
}

fn client(server: &MockServer) -> ApiClient {
    ApiClient::new(test_config(server), Connectivity::online()).unwrap()
}

fn queue() -> Arc<OutboundQueue> {
    Arc::new(OutboundQueue::open(Arc::new(MemoryStore::new()), QueueConfig::default()).unwrap())
}

// ── Config ──────────────────────────────────────────────────────

#[test]
fn api_config_defaults() {
    let cfg = ApiConfig::default();
    assert_eq!(cfg.timeout_ms, 30_000);
    assert_eq!(cfg.max_attempts, 3);
    assert_eq!(cfg.cache_ttl_ms, 300_000);
    assert!(cfg.bearer_token.is_none());
    assert!(cfg.queue_mutations_on_failure);
}

#[test]
fn retry_delay_grows_geometrically() {
    let cfg = ApiConfig {
        retry_base_delay_ms: 1_000,
        backoff_multiplier: 2,
        ..Default::default()
    };
    assert_eq!(cfg.retry_delay(1).as_millis(), 1_000);
    assert_eq!(cfg.retry_delay(2).as_millis(), 2_000);
    assert_eq!(cfg.retry_delay(3).as_millis(), 4_000);
}

#[test]
fn partial_config_json_uses_defaults() {
    let cfg: ApiConfig = serde_json::from_str(r#"{"base_url":"https://api.example.org"}"#).unwrap();
    assert_eq!(cfg.base_url, "https://api.example.org");
    assert_eq!(cfg.max_attempts, 3);
}

// ── Request validation ──────────────────────────────────────────

#[tokio::test]
async fn relative_endpoint_is_rejected() {
    let server = MockServer::start().await;
    let err = client(&server).get("api/projects").await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest(_)));
    assert!(err.is_terminal());
}

// ── Retries ─────────────────────────────────────────────────────

#[tokio::test]
async fn server_error_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let value = client.get("/api/projects").await.unwrap();
    assert_eq!(value, json!([{"id": 1}]));
    assert_eq!(client.stats().retries, 2);
}

#[tokio::test]
async fn retries_reuse_the_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    client(&server).get("/api/projects").await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    let ids: Vec<String> = received
        .iter()
        .map(|r| {
            r.headers
                .get(REQUEST_ID_HEADER)
                .expect("request id header")
                .to_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(ids[0], ids[1]);
    assert!(!ids[0].is_empty());
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(422).set_body_string("name is required"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(test_config(&server), Connectivity::online())
        .unwrap()
        .with_queue(queue());
    let err = client.post("/api/projects", json!({})).await.unwrap_err();

    assert_eq!(err.status(), Some(422));
    assert!(err.is_terminal());
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("name is required"));
    assert_eq!(client.stats().queue_pending, 0);
}

#[tokio::test]
async fn exhausted_read_returns_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server).get("/api/field-data").await.unwrap_err();
    assert_eq!(err.status(), Some(502));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn exhausted_mutation_is_queued() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let q = queue();
    let client = ApiClient::new(test_config(&server), Connectivity::online())
        .unwrap()
        .with_queue(Arc::clone(&q));
    let resp = client
        .put("/api/projects/4", json!({"name": "Mangrove"}))
        .await
        .unwrap();

    assert!(resp.is_queued());
    let items = q.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].endpoint, "/api/projects/4");
    assert_eq!(items[0].attempt_count, 1);
    assert!(items[0].last_error.is_some());
}

fn slow_config(server: &MockServer) -> ApiConfig {
    ApiConfig {
        timeout_ms: 200,
        ..test_config(server)
    }
}

#[tokio::test]
async fn timed_out_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(2)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .mount(&server)
        .await;

    let client = ApiClient::new(slow_config(&server), Connectivity::online()).unwrap();
    let body = client.get("/api/projects").await.unwrap();

    assert_eq!(body, json!([{"id": 1}]));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(client.stats().retries, 1);
}

#[tokio::test]
async fn persistent_timeout_is_reported_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let cfg = ApiConfig {
        max_attempts: 1,
        ..slow_config(&server)
    };
    let client = ApiClient::new(cfg, Connectivity::online()).unwrap();
    let err = client.get("/api/projects").await.unwrap_err();

    assert!(matches!(err, ApiError::Timeout), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn timed_out_mutation_is_queued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/field_data"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let q = queue();
    let cfg = ApiConfig {
        max_attempts: 2,
        ..slow_config(&server)
    };
    let client = ApiClient::new(cfg, Connectivity::online())
        .unwrap()
        .with_queue(Arc::clone(&q));
    let resp = client
        .post("/api/field_data", json!({"site": "B"}))
        .await
        .unwrap();

    assert!(resp.is_queued());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    let items = q.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].endpoint, "/api/field_data");
    assert_eq!(items[0].last_error.as_deref(), Some("request timed out"));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let cfg = ApiConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        max_attempts: 1,
        timeout_ms: 1_000,
        ..Default::default()
    };
    let client = ApiClient::new(cfg, Connectivity::online()).unwrap();
    let err = client.get("/api/projects").await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

// ── Headers and bodies ──────────────────────────────────────────

#[tokio::test]
async fn bearer_token_and_json_body_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/field-data"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(json!({"plot": "A1", "biomass": 12.5})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 99})))
        .expect(1)
        .mount(&server)
        .await;

    let cfg = ApiConfig {
        bearer_token: Some("secret-token".to_string()),
        ..test_config(&server)
    };
    let client = ApiClient::new(cfg, Connectivity::online()).unwrap();
    let resp = client
        .post("/api/field-data", json!({"plot": "A1", "biomass": 12.5}))
        .await
        .unwrap();
    assert_eq!(resp, ApiResponse::Data(json!({"id": 99})));
}

#[tokio::test]
async fn extra_headers_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-device", "tablet-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let opts = RequestOptions::default().with_header("X-Device", "tablet-7");
    client(&server)
        .get_with("/api/projects", &opts)
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_body_is_null() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let resp = client(&server).delete("/api/projects/4").await.unwrap();
    assert_eq!(resp.into_data(), Some(serde_json::Value::Null));
}

// ── Cache ───────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_read_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let first = client.get("/api/projects").await.unwrap();
    let second = client.get("/api/projects").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.stats().cache_hits, 1);
    assert_eq!(client.stats().cache_entries, 1);
}

#[tokio::test]
async fn bypass_cache_always_hits_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let opts = RequestOptions::default().bypass_cache();
    client.get_with("/api/projects", &opts).await.unwrap();
    client.get_with("/api/projects", &opts).await.unwrap();
    assert_eq!(client.stats().cache_entries, 0);
}

#[tokio::test]
async fn write_invalidates_resource_family() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/carbon-credits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 4})))
        .mount(&server)
        .await;

    let client = client(&server);
    client.get("/api/projects").await.unwrap();
    client.get("/api/carbon-credits").await.unwrap();
    client
        .patch("/api/projects/4", json!({"status": "verified"}))
        .await
        .unwrap();

    // projects refetched, credits still cached
    client.get("/api/projects").await.unwrap();
    client.get("/api/carbon-credits").await.unwrap();
}

#[tokio::test]
async fn clear_cache_drops_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    client.get("/api/projects").await.unwrap();
    client.clear_cache();
    client.get("/api/projects").await.unwrap();
}

// ── Offline ─────────────────────────────────────────────────────

#[tokio::test]
async fn offline_mutation_is_queued_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let q = queue();
    let client = ApiClient::new(test_config(&server), Connectivity::offline())
        .unwrap()
        .with_queue(Arc::clone(&q));

    let resp = client
        .post("/api/field-data", json!({"plot": "B2"}))
        .await
        .unwrap();
    let ApiResponse::Queued(id) = resp else {
        panic!("expected queued response, got {resp:?}");
    };
    assert_eq!(q.pending_count(), 1);
    assert_eq!(q.get(id).unwrap().body, Some(json!({"plot": "B2"})));
    assert_eq!(client.stats().queued, 1);
}

#[tokio::test]
async fn offline_mutation_without_queue_fails() {
    let server = MockServer::start().await;
    let client = ApiClient::new(test_config(&server), Connectivity::offline()).unwrap();
    let err = client
        .post("/api/field-data", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Offline(_)));
}

#[tokio::test]
async fn offline_mutation_with_no_queue_option_fails() {
    let server = MockServer::start().await;
    let q = queue();
    let client = ApiClient::new(test_config(&server), Connectivity::offline())
        .unwrap()
        .with_queue(Arc::clone(&q));

    let err = client
        .request(
            ApiRequest::post("/api/field-data", json!({})),
            &RequestOptions::default().no_queue(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Offline(_)));
    assert_eq!(q.pending_count(), 0);
}

#[tokio::test]
async fn offline_read_uses_fresh_cache_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let connectivity = Connectivity::online();
    let client = ApiClient::new(test_config(&server), connectivity.clone()).unwrap();
    client.get("/api/projects").await.unwrap();

    connectivity.set_online(false);
    assert_eq!(client.get("/api/projects").await.unwrap(), json!([{"id": 1}]));

    let err = client.get("/api/carbon-credits").await.unwrap_err();
    assert!(matches!(err, ApiError::Offline(ref e) if e == "/api/carbon-credits"));
}

// ── Diagnostics ─────────────────────────────────────────────────

#[tokio::test]
async fn health_check_reports_server_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(client.health_check().await);
    assert!(!client.health_check().await);
}

#[tokio::test]
async fn stats_reflect_client_state() {
    let server = MockServer::start().await;
    let q = queue();
    let connectivity = Connectivity::offline();
    let client = ApiClient::new(test_config(&server), connectivity.clone())
        .unwrap()
        .with_queue(Arc::clone(&q));

    client.delete("/api/projects/1").await.unwrap();
    client.delete("/api/projects/2").await.unwrap();

    let stats = client.stats();
    assert_eq!(stats.base_url, server.uri());
    assert!(!stats.online);
    assert_eq!(stats.queue_pending, 2);
    assert_eq!(stats.dead_letters, 0);
    assert_eq!(stats.requests_sent, 0);
    assert_eq!(stats.queued, 2);
}
