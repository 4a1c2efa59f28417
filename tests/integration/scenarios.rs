//! End-to-end scenarios across ingestion, alerting and notification
//!
//! These tests verify that:
//! - Silent agents go offline exactly once
//! - Derived rates trigger utilization alerts on every sink
//! - IP changes are stored and fanned out
//! - Webhook deliveries retry with a stable delivery id and valid signature
//! - The sink rate limit drops excess events without any HTTP request
//! - Retention cleanup removes exactly the expired rows

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use wameter::{
    actors::LivenessActor,
    config::RateLimitConfig,
    notify::{
        NotificationManager, Notifier, NotifyHandle, SinkType, TemplateLoader,
        sinks::webhook::{DELIVERY_HEADER, SIGNATURE_HEADER, WebhookSink},
        transport::RetryPolicy,
    },
    storage::{MemoryBackend, QueryParams, StorageBackend},
    types::{AgentStatus, AlertEvent, InterfaceStats},
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[cfg(feature = "api")]
#[tokio::test]
async fn test_offline_transition_is_reported_once() {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use wameter::api::{self, ApiState, middleware::Authenticator};
    use wameter::config::ApiConfig;
    use wameter::health::HealthChecker;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let (notify, mut queue) = NotifyHandle::channel(100);
    let (pipeline, registry) = create_pipeline(Arc::clone(&storage), notify.clone());

    // Last report 5m1s ago
    let t0 = Utc::now() - chrono::Duration::seconds(5 * 60 + 1);
    registry.touch(&create_envelope("A1", t0), t0);

    let liveness = LivenessActor::new(Arc::clone(&registry), notify.clone(), Duration::from_secs(60));
    assert_eq!(liveness.sweep().await, 1);
    assert_eq!(liveness.sweep().await, 0, "second tick must not re-emit");

    let checker = HealthChecker::new(Arc::clone(&storage), Arc::clone(&registry), Vec::new());
    let state = ApiState::new(storage, pipeline, notify, checker, Authenticator::disabled());
    let app = api::router(state, &ApiConfig::default(), Duration::from_secs(30));

    let response = app
        .oneshot(Request::get("/v1/agents/A1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let agent: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(agent["status"], "offline");

    let notification = queue.try_recv().unwrap();
    assert!(matches!(notification.event, AlertEvent::AgentOffline { ref agent } if agent.id == "A1"));
    assert!(queue.try_recv().is_err(), "exactly one offline event");
    assert_eq!(registry.get("A1").unwrap().status, AgentStatus::Offline);
}

#[tokio::test]
async fn test_high_utilization_alert_per_sink() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let webhook = RecordingSink::new(SinkType::Webhook);
    let slack = RecordingSink::new(SinkType::Slack);
    let (manager, handle) = NotificationManager::new(
        &create_notify_config(),
        vec![webhook.clone() as Arc<dyn Notifier>, slack.clone()],
    );
    let dispatcher = tokio::spawn(manager.run(CancellationToken::new()));
    let (pipeline, _registry) = create_pipeline(Arc::clone(&storage), handle.clone());

    let now = Utc::now();
    let previous = create_envelope_with_eth0(
        "A1",
        now - chrono::Duration::seconds(1),
        InterfaceStats {
            speed_mbps: 100,
            ..Default::default()
        },
    );
    storage.save_metrics(&previous).await.unwrap();

    let current = create_envelope_with_eth0(
        "A1",
        now,
        InterfaceStats {
            speed_mbps: 100,
            rx_bytes: 150_000_000,
            ..Default::default()
        },
    );
    pipeline.ingest(current).await.unwrap();
    pipeline.flush().await;

    drop(pipeline);
    drop(handle);
    dispatcher.await.unwrap();

    for sink in [&webhook, &slack] {
        assert_eq!(sink.event_types(), vec!["high_utilization"]);
        match &sink.events.lock()[0] {
            AlertEvent::HighUtilization { agent_id, interface, .. } => {
                assert_eq!(agent_id, "A1");
                let rate = interface.stats.as_ref().unwrap().rx_bytes_rate;
                assert!((rate - 150_000_000.0).abs() < 1.0, "rate was {rate}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_ip_change_is_stored_and_notified() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let webhook = RecordingSink::new(SinkType::Webhook);
    let email = RecordingSink::new(SinkType::Email);
    let (manager, handle) = NotificationManager::new(
        &create_notify_config(),
        vec![webhook.clone() as Arc<dyn Notifier>, email.clone()],
    );
    let dispatcher = tokio::spawn(manager.run(CancellationToken::new()));
    let (pipeline, _registry) = create_pipeline(Arc::clone(&storage), handle.clone());

    let now = Utc::now();
    let mut envelope = create_envelope("A1", now);
    let mut change = create_ip_change("A1", now);
    change.agent_id.clear(); // filled from the envelope
    envelope.payload.ip_changes.push(change);

    pipeline.ingest(envelope).await.unwrap();
    pipeline.flush().await;

    let stored = storage
        .get_interface_changes("A1", "eth0", now - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].agent_id, "A1");
    assert_eq!(stored[0].new_addrs, vec!["10.0.0.6"]);

    drop(pipeline);
    drop(handle);
    dispatcher.await.unwrap();

    for sink in [&webhook, &email] {
        assert_eq!(sink.event_types(), vec!["ip_change"]);
    }
}

fn hex_hmac(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn test_webhook_retries_with_stable_delivery_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let config = create_webhook_config(&format!("{}/hook", server.uri()), Some("k"));
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let sink = WebhookSink::new(&config, policy, Arc::new(TemplateLoader::new())).unwrap();

    let agent = wameter::types::AgentInfo::new("A1", "h1", Utc::now());
    sink.notify_agent_offline(&agent).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let delivery = requests[0].headers.get(DELIVERY_HEADER).unwrap().clone();
    for request in &requests {
        assert_eq!(request.headers.get(DELIVERY_HEADER).unwrap(), &delivery);
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert_eq!(signature, hex_hmac("k", &request.body));
    }
}

#[tokio::test]
async fn test_rate_limit_drops_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut notify = create_notify_config();
    notify.rate_limit = RateLimitConfig {
        enabled: true,
        interval: Duration::from_secs(60),
        max_events: 2,
        per_channel: true,
        per_agent: false,
    };
    let config = create_webhook_config(&server.uri(), None);
    let sink = WebhookSink::new(
        &config,
        RetryPolicy::from_config(&notify),
        Arc::new(TemplateLoader::new()),
    )
    .unwrap();
    let (manager, handle) = NotificationManager::new(&notify, vec![Arc::new(sink)]);
    let dispatcher = tokio::spawn(manager.run(CancellationToken::new()));

    for agent in ["A1", "A2", "A3"] {
        let event = AlertEvent::AgentOffline {
            agent: wameter::types::AgentInfo::new(agent, "h1", Utc::now()),
        };
        assert!(handle.enqueue(event));
    }
    let stats = handle.clone();
    drop(handle);
    dispatcher.await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    let snapshot = stats.stats();
    assert_eq!(snapshot.rate_limited, 1);
    assert_eq!(snapshot.delivered, 2);
}

#[tokio::test]
async fn test_retention_cleanup_in_memory() {
    let storage = MemoryBackend::with_batch_size(1000);
    let now = Utc::now().with_nanosecond(0).unwrap();
    let cutoff = now - chrono::Duration::days(30);

    let envelopes: Vec<_> = (0..5000i64)
        .map(|i| create_envelope("A1", now - chrono::Duration::seconds(i * 1036 + 1)))
        .collect();
    let expired = envelopes.iter().filter(|e| e.timestamp < cutoff).count();
    storage.save_metrics_batch(&envelopes).await.unwrap();

    let summary = storage.cleanup(cutoff, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.deleted as usize, expired);
    assert!(summary.largest_batch <= 1000);
    assert_eq!(storage.metrics_len(), 5000 - expired);

    let remaining = storage
        .query_metrics(&QueryParams {
            limit: Some(10_000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(remaining.iter().all(|e| e.timestamp >= cutoff));
}
