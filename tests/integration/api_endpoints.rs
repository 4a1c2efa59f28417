//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - Ingestion endpoints accept valid reports and reject bad ones
//! - Agent and metric queries return stored data
//! - Errors share one JSON shape
//! - Authentication guards everything except health, token and docs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use wameter::{
    api::{self, ApiState, middleware::Authenticator},
    config::{ApiConfig, AuthConfig, AuthType, UserCredential},
    health::HealthChecker,
    notify::{Notification, NotifyHandle},
    storage::{MemoryBackend, StorageBackend},
    types::InterfaceStats,
};

use crate::helpers::*;

struct TestApi {
    addr: SocketAddr,
    storage: Arc<dyn StorageBackend>,
    client: reqwest::Client,
    _queue: mpsc::Receiver<Notification>,
}

impl TestApi {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

// Serve the router on a random local port
async fn spawn_test_api(auth: AuthConfig) -> TestApi {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let (notify, queue) = NotifyHandle::channel(64);
    let (pipeline, registry) = create_pipeline(Arc::clone(&storage), notify.clone());
    let checker = HealthChecker::new(Arc::clone(&storage), registry, Vec::new());
    let state = ApiState::new(
        Arc::clone(&storage),
        pipeline,
        notify,
        checker,
        Authenticator::from_config(&auth).unwrap(),
    );

    let config = ApiConfig {
        auth,
        ..Default::default()
    };
    let app = api::router(state, &config, Duration::from_secs(10));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApi {
        addr,
        storage,
        client: reqwest::Client::new(),
        _queue: queue,
    }
}

fn jwt_auth() -> AuthConfig {
    AuthConfig {
        kind: AuthType::Jwt,
        jwt_secret: Some("integration-secret".into()),
        allowed_users: vec![UserCredential {
            username: "ops".into(),
            password: "hunter2".into(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ingest_then_query() {
    let api = spawn_test_api(AuthConfig::default()).await;
    let now = Utc::now();

    let envelope = create_envelope_with_eth0("A1", now, InterfaceStats::default());
    let response = api
        .client
        .post(api.url("/v1/metrics"))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let agents: Value = api
        .client
        .get(api.url("/v1/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents.as_array().unwrap().len(), 1);
    assert_eq!(agents[0]["id"], "A1");
    assert_eq!(agents[0]["status"], "online");

    let latest: Value = api
        .client
        .get(api.url("/v1/agents/A1/metrics/latest"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["agent_id"], "A1");

    let metrics: Value = api
        .client
        .get(api.url("/v1/metrics?agent_ids=A1,A2&limit=50000"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_report_is_bad_request() {
    let api = spawn_test_api(AuthConfig::default()).await;

    let response = api
        .client
        .post(api.url("/v1/metrics"))
        .json(&json!({"agent_id": "A1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "invalid_input");

    let response = api
        .client
        .get(api.url("/v1/metrics?limit=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_reports_per_item_status() {
    let api = spawn_test_api(AuthConfig::default()).await;
    let now = Utc::now();

    let mut invalid = create_envelope("A2", now);
    invalid.hostname.clear();
    let batch = vec![create_envelope("A1", now), invalid, create_envelope("A3", now)];

    let response = api
        .client
        .post(api.url("/v1/metrics:batch"))
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["rejected"], 1);
    assert_eq!(body["items"][1]["status"], "rejected");
    assert_eq!(body["items"][1]["agent_id"], "A2");
    assert!(body["items"][1]["error"].is_string());

    assert!(api.storage.get_latest_metrics("A2").await.is_err());
    assert!(api.storage.get_latest_metrics("A3").await.is_ok());
}

#[tokio::test]
async fn test_unknown_agent_is_not_found() {
    let api = spawn_test_api(AuthConfig::default()).await;

    for path in ["/v1/agents/ghost", "/v1/agents/ghost/ip-changes/summary"] {
        let response = api.client.get(api.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "not_found");
    }

    let response = api
        .client
        .delete(api.url("/v1/agents/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_agent() {
    let api = spawn_test_api(AuthConfig::default()).await;
    api.client
        .post(api.url("/v1/metrics"))
        .json(&create_envelope("A1", Utc::now()))
        .send()
        .await
        .unwrap();
    // Registry persistence is asynchronous
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = api
        .client
        .delete(api.url("/v1/agents/A1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = api.client.get(api.url("/v1/agents/A1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ip_changes_endpoint() {
    let api = spawn_test_api(AuthConfig::default()).await;
    let now = Utc::now();
    let mut envelope = create_envelope("A1", now);
    envelope.payload.ip_changes.push(create_ip_change("A1", now));

    api.client
        .post(api.url("/v1/metrics"))
        .json(&envelope)
        .send()
        .await
        .unwrap();

    let changes: Value = api
        .client
        .get(api.url("/v1/agents/A1/ip-changes?interface=eth0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(changes.as_array().unwrap().len(), 1);

    let summary: Value = api
        .client
        .get(api.url("/v1/agents/A1/ip-changes/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["total_changes"], 1);
}

#[tokio::test]
async fn test_health_and_stats() {
    let api = spawn_test_api(AuthConfig::default()).await;

    let response = api.client.get(api.url("/v1/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: Value = response.json().await.unwrap();
    assert_eq!(health["healthy"], true);

    let stats: Value = api
        .client
        .get(api.url("/v1/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["agents"]["total"], 0);
    assert_eq!(stats["storage"]["driver"], "memory");
    assert!(stats["notify"]["enqueued"].is_u64());
}

#[tokio::test]
async fn test_jwt_guards_protected_routes() {
    let api = spawn_test_api(jwt_auth()).await;

    // Public routes stay open
    let response = api.client.get(api.url("/v1/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = api
        .client
        .get(api.url("/v1/docs/openapi.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = api.client.get(api.url("/v1/agents")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "unauthorized");

    let response = api
        .client
        .post(api.url("/v1/auth/token"))
        .json(&json!({"username": "ops", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token: Value = api
        .client
        .post(api.url("/v1/auth/token"))
        .json(&json!({"username": "ops", "password": "hunter2"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(token["token_type"], "Bearer");

    let response = api
        .client
        .get(api.url("/v1/agents"))
        .bearer_auth(token["token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_api_key_header() {
    let api = spawn_test_api(AuthConfig {
        kind: AuthType::ApiKey,
        api_keys: vec!["k-123".into()],
        ..Default::default()
    })
    .await;

    let response = api
        .client
        .get(api.url("/v1/stats"))
        .header("X-API-Key", "k-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = api
        .client
        .get(api.url("/v1/stats"))
        .header("X-API-Key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
