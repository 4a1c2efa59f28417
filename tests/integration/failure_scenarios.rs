//! Failure tests for ingestion, notification and shutdown
//!
//! These tests verify that the server handles failures gracefully:
//! - Malformed reports are rejected without side effects
//! - A failing sink never blocks the others
//! - Webhook delivery gives up after the retry budget
//! - Storage outages surface as unhealthy and unavailable
//! - Shutdown stops background tasks and closes storage

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use wameter::{
    Error, ErrorKind, Result,
    actors::LivenessActor,
    health::{ComponentStatus, HealthChecker},
    lifecycle::Lifecycle,
    notify::{
        NotificationManager, Notifier, NotifyHandle, SinkType, TemplateLoader,
        sinks::webhook::WebhookSink, transport::RetryPolicy,
    },
    registry::AgentRegistry,
    storage::{MemoryBackend, QueryParams, StorageBackend},
    types::{AgentInfo, AlertEvent},
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Sink whose every call fails
struct BrokenSink;

#[async_trait]
impl Notifier for BrokenSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Telegram
    }

    async fn send(&self, _event: &AlertEvent) -> Result<()> {
        Err(Error::unavailable("broken.send", "endpoint down"))
    }

    async fn health(&self) -> Result<()> {
        Err(Error::unavailable("broken.health", "endpoint down"))
    }
}

fn offline_event(agent_id: &str) -> AlertEvent {
    AlertEvent::AgentOffline {
        agent: AgentInfo::new(agent_id, "h1", Utc::now()),
    }
}

#[tokio::test]
async fn test_malformed_report_is_rejected() {
    let storage = Arc::new(MemoryBackend::new());
    let (notify, _queue) = NotifyHandle::channel(16);
    let (pipeline, registry) = create_pipeline(storage.clone(), notify);

    let missing_agent = create_envelope("", Utc::now());
    let err = pipeline.ingest(missing_agent).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let mut inverted = create_envelope("A1", Utc::now());
    inverted.collected_at = inverted.reported_at + chrono::Duration::seconds(5);
    let err = pipeline.ingest(inverted).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert_eq!(pipeline.stats().rejected, 2);
    assert_eq!(pipeline.stats().accepted, 0);
    assert!(registry.is_empty(), "rejected reports must not register agents");
    assert_eq!(storage.metrics_len(), 0);
}

#[tokio::test]
async fn test_failing_sink_does_not_block_others() {
    let recording = RecordingSink::new(SinkType::Webhook);
    let (manager, handle) = NotificationManager::new(
        &create_notify_config(),
        vec![Arc::new(BrokenSink) as Arc<dyn Notifier>, recording.clone()],
    );
    let dispatcher = tokio::spawn(manager.run(CancellationToken::new()));

    assert!(handle.enqueue(offline_event("A1")));
    assert!(handle.enqueue(offline_event("A2")));
    let stats = handle.clone();
    drop(handle);
    dispatcher.await.unwrap();

    assert_eq!(recording.event_types(), vec!["agent_offline", "agent_offline"]);
    let snapshot = stats.stats();
    assert_eq!(snapshot.failed, 2);
    assert_eq!(snapshot.delivered, 2);
}

#[tokio::test]
async fn test_webhook_gives_up_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = create_webhook_config(&server.uri(), None);
    config.max_retries = Some(1);
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let sink = WebhookSink::new(&config, policy, Arc::new(TemplateLoader::new())).unwrap();

    let result = sink.send(&offline_event("A1")).await;
    assert!(result.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let config = create_webhook_config(&server.uri(), None);
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let sink = WebhookSink::new(&config, policy, Arc::new(TemplateLoader::new())).unwrap();

    assert!(sink.send(&offline_event("A1")).await.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_storage_outage_is_unhealthy() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let (notify, _queue) = NotifyHandle::channel(16);
    let (pipeline, registry) = create_pipeline(Arc::clone(&storage), notify);
    let checker = HealthChecker::new(Arc::clone(&storage), registry, Vec::new());

    assert!(checker.check().await.healthy);

    storage.close().await.unwrap();
    let report = checker.check().await;
    assert!(!report.healthy);
    assert_eq!(report.components[0].name, "storage");
    assert_eq!(report.components[0].status, ComponentStatus::Unhealthy);

    let err = pipeline.ingest(create_envelope("A1", Utc::now())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.kind().is_transient());
}

#[tokio::test]
async fn test_sink_outage_is_degraded_only() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&storage), OFFLINE_THRESHOLD));
    let checker = HealthChecker::new(storage, registry, vec![Arc::new(BrokenSink)]);

    let report = checker.check().await;
    assert!(report.healthy);
    let sink = report
        .components
        .iter()
        .find(|c| c.name.starts_with("sink:"))
        .unwrap();
    assert_eq!(sink.status, ComponentStatus::Degraded);
    assert_eq!(report.unhealthy_components().count(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_tasks_and_closes_storage() {
    let storage = Arc::new(MemoryBackend::new());
    let registry = Arc::new(AgentRegistry::new(storage.clone(), OFFLINE_THRESHOLD));
    let (notify, _queue) = NotifyHandle::channel(16);

    let lifecycle = Lifecycle::new(Duration::from_secs(2));
    let liveness = LivenessActor::new(registry, notify, Duration::from_millis(10));
    lifecycle.spawn_supervised("liveness", move |cancel| liveness.clone().run(cancel));

    tokio::time::sleep(Duration::from_millis(30)).await;
    lifecycle.shutdown(storage.as_ref()).await.unwrap();

    assert!(lifecycle.is_cancelled());
    let err = storage.query_metrics(&QueryParams::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn test_shutdown_reports_stuck_task() {
    let storage = MemoryBackend::new();
    let lifecycle = Lifecycle::new(Duration::from_millis(20));
    lifecycle.spawn("stuck", async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let err = lifecycle.shutdown(&storage).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    // Storage is closed regardless.
    assert!(storage.ping().await.is_err());
}
