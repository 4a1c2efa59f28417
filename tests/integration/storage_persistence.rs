//! Integration tests for SQLite persistence
//!
//! These tests verify that:
//! - Agents and reports survive a reconnect
//! - Batch writes are queryable with filters and ordering
//! - Previous-report lookup feeds rate derivation
//! - Retention cleanup deletes in bounded batches

use std::sync::Arc;

use chrono::{Duration, Timelike, Utc};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use wameter::{
    ErrorKind,
    registry::AgentRegistry,
    storage::{
        self, QueryParams, SortOrder, StorageBackend, migrate::Migrator, sqlite::SqliteBackend,
    },
    types::{AgentStatus, InterfaceStats},
};

use crate::helpers::*;

#[tokio::test]
async fn test_agents_and_metrics_survive_reconnect() {
    let temp_dir = tempdir().unwrap();
    let config = create_sqlite_config(temp_dir.path());
    let now = Utc::now().with_nanosecond(0).unwrap();

    {
        let backend = storage::connect(&config).await.unwrap();
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&backend), OFFLINE_THRESHOLD));
        registry.touch(&create_envelope("A1", now), now);
        registry.persist_all().await.unwrap();

        backend
            .save_metrics(&create_envelope_with_eth0("A1", now, InterfaceStats::default()))
            .await
            .unwrap();
        backend.save_ip_change("A1", &create_ip_change("A1", now)).await.unwrap();
        backend.close().await.unwrap();
    }

    let backend = storage::connect(&config).await.unwrap();
    let registry = AgentRegistry::new(Arc::clone(&backend), OFFLINE_THRESHOLD);
    assert_eq!(registry.hydrate().await.unwrap(), 1);

    let agent = registry.get("A1").unwrap();
    assert_eq!(agent.hostname, "h1");
    assert_eq!(agent.version, "1.2.0");
    assert_eq!(agent.status, AgentStatus::Online);

    let latest = backend.get_latest_metrics("A1").await.unwrap();
    assert_eq!(latest.timestamp, now);
    assert!(latest.payload.interfaces.contains_key("eth0"));

    let changes = backend.get_recent_ip_changes("A1", now - Duration::hours(1)).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].old_addrs, vec!["10.0.0.5"]);

    let summary = backend.get_ip_change_summary("A1").await.unwrap();
    assert_eq!(summary.total_changes, 1);
    assert_eq!(summary.changes_by_interface.get("eth0"), Some(&1));
}

#[tokio::test]
async fn test_batch_query_filters_and_orders() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::connect(&create_sqlite_config(temp_dir.path())).await.unwrap();
    let now = Utc::now().with_nanosecond(0).unwrap();

    let envelopes: Vec<_> = (0..10i64)
        .flat_map(|i| {
            let at = now - Duration::minutes(i);
            [create_envelope("A1", at), create_envelope("A2", at)]
        })
        .collect();
    backend.save_metrics_batch(&envelopes).await.unwrap();

    let newest_first = backend
        .query_metrics(&QueryParams {
            agent_ids: vec!["A1".into()],
            start: Some(now - Duration::minutes(4)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(newest_first.len(), 5);
    assert!(newest_first.iter().all(|e| e.agent_id == "A1"));
    assert_eq!(newest_first[0].timestamp, now);

    let oldest_first = backend
        .query_metrics(&QueryParams {
            limit: Some(3),
            offset: 1,
            order: SortOrder::Asc,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(oldest_first.len(), 3);
    assert!(oldest_first.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_previous_metrics_lookup() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::connect(&create_sqlite_config(temp_dir.path())).await.unwrap();
    let now = Utc::now().with_nanosecond(0).unwrap();

    for secs in [30, 20, 10] {
        backend
            .save_metrics(&create_envelope("A1", now - Duration::seconds(secs)))
            .await
            .unwrap();
    }

    let previous = backend.get_previous_metrics("A1", now).await.unwrap().unwrap();
    assert_eq!(previous.collected_at, now - Duration::seconds(10));

    let none = backend
        .get_previous_metrics("A1", now - Duration::seconds(30))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_delete_agent_removes_history() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::connect(&create_sqlite_config(temp_dir.path())).await.unwrap();
    let now = Utc::now();

    let agent = wameter::types::AgentInfo::new("A1", "h1", now);
    backend.register_or_update_agent(&agent).await.unwrap();
    backend.save_metrics(&create_envelope("A1", now)).await.unwrap();

    backend.delete_agent("A1").await.unwrap();
    assert_eq!(backend.get_agent("A1").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        backend.get_latest_metrics("A1").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_retention_cleanup_in_sqlite() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::connect(&create_sqlite_config(temp_dir.path())).await.unwrap();
    let batch_size = backend.batch_size();
    let now = Utc::now().with_nanosecond(0).unwrap();
    let cutoff = now - Duration::days(30);

    let envelopes: Vec<_> = (0..5000i64)
        .map(|i| create_envelope("A1", now - Duration::seconds(i * 1036 + 1)))
        .collect();
    let expired = envelopes.iter().filter(|e| e.timestamp < cutoff).count();
    backend.save_metrics_batch(&envelopes).await.unwrap();

    let summary = backend.cleanup(cutoff, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.deleted as usize, expired);
    assert!(summary.largest_batch <= batch_size);
    assert!(summary.batches >= 1);

    let remaining = backend
        .query_metrics(&QueryParams {
            limit: Some(10_000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(remaining.len(), 5000 - expired);
    assert!(remaining.iter().all(|e| e.timestamp >= cutoff));

    let again = backend.cleanup(cutoff, &CancellationToken::new()).await.unwrap();
    assert_eq!(again.deleted, 0);
}

#[tokio::test]
async fn test_rollback_steps_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let mut config = create_sqlite_config(temp_dir.path());

    let backend = SqliteBackend::connect(&config).await.unwrap();
    backend.close().await.unwrap();

    config.rollback_steps = 1;
    let migrator = Migrator::embedded().unwrap();
    for _ in 0..2 {
        let backend = SqliteBackend::connect(&config).await.unwrap();
        let applied = migrator.applied_versions(backend.pool()).await.unwrap();
        assert_eq!(applied.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        backend.close().await.unwrap();
    }

    config.rollback_steps = 0;
    let backend = SqliteBackend::connect(&config).await.unwrap();
    let applied = migrator.applied_versions(backend.pool()).await.unwrap();
    assert_eq!(applied.len(), 3);
}
