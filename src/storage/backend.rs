//! Storage backend trait definition
//!
//! This module defines the core `StorageBackend` trait that all
//! storage drivers implement, plus the parameter and result types it uses.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::stats::StorageStats;
use crate::error::Result;
use crate::types::{AgentInfo, AgentStatus, IpChange, MetricsEnvelope};

/// Hard upper bound on rows returned by one metrics query
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Rows returned when the caller gives no limit
pub const DEFAULT_QUERY_LIMIT: usize = 1_000;

/// Cleanup batch size for regular backends
pub const DEFAULT_CLEANUP_BATCH: usize = 1_000;

/// Cleanup batch size for memory- or lock-constrained backends
pub const CONSTRAINED_CLEANUP_BATCH: usize = 500;

/// Pagination window for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Timestamp,
    CollectedAt,
    ReportedAt,
    AgentId,
}

impl OrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            OrderBy::Timestamp => "timestamp",
            OrderBy::CollectedAt => "collected_at",
            OrderBy::ReportedAt => "reported_at",
            OrderBy::AgentId => "agent_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter for `query_metrics`
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Restrict to these agents; all agents when empty
    pub agent_ids: Vec<String>,
    /// Inclusive lower bound on `timestamp`
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order_by: OrderBy,
    pub order: SortOrder,
}

impl QueryParams {
    /// The limit actually applied: defaulted, then clamped to [`MAX_QUERY_LIMIT`]
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }
}

/// Aggregate view over one agent's IP-change history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IpChangeSummary {
    pub agent_id: String,
    pub total_changes: u64,
    pub external_changes: u64,
    pub changes_by_interface: BTreeMap<String, u64>,
    pub last_change: Option<DateTime<Utc>>,
    /// Latest known external address, from the newest external change
    pub current_external_ip: Option<String>,
}

/// Outcome of one `cleanup` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub deleted: u64,
    pub batches: u32,
    pub largest_batch: usize,
    /// Stopped early because the cancellation token fired
    pub cancelled: bool,
}

/// Trait for persistent storage backends
///
/// ## Cancellation
///
/// Every operation is an ordinary future: dropping it cancels the work.
/// Drivers additionally bound each query with the configured
/// `query_timeout` and fail with `ErrorKind::Timeout` when it elapses.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by the
/// request handlers and every background loop.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Driver identifier, e.g. `"sqlite"`
    fn driver(&self) -> &'static str;

    /// Insert or replace the agent row keyed by `id`
    async fn register_or_update_agent(&self, agent: &AgentInfo) -> Result<()>;

    /// Set `status` and `updated_at = now`. Moving to `online` also advances
    /// `last_seen`. Fails with `NotFound` if the agent is unknown.
    async fn update_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_agent(&self, id: &str) -> Result<AgentInfo>;

    /// Agents ordered by hostname (then id). Never fails on an empty table.
    async fn list_agents(&self, page: Option<Page>) -> Result<Vec<AgentInfo>>;

    /// Remove an agent with its metrics and IP changes in one transaction
    async fn delete_agent(&self, id: &str) -> Result<()>;

    async fn save_metrics(&self, envelope: &MetricsEnvelope) -> Result<()>;

    /// All-or-nothing insert of several envelopes
    async fn save_metrics_batch(&self, envelopes: &[MetricsEnvelope]) -> Result<()>;

    /// All-or-nothing insert of envelopes together with the IP changes they
    /// carry, each change stored under its envelope's `agent_id`
    async fn save_reports(&self, envelopes: &[MetricsEnvelope]) -> Result<()>;

    async fn query_metrics(&self, params: &QueryParams) -> Result<Vec<MetricsEnvelope>>;

    /// Newest envelope by `timestamp`; `NotFound` when the agent never reported
    async fn get_latest_metrics(&self, agent_id: &str) -> Result<MetricsEnvelope>;

    /// Newest envelope whose `collected_at` is strictly before `before`
    async fn get_previous_metrics(
        &self,
        agent_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<MetricsEnvelope>>;

    async fn save_ip_change(&self, agent_id: &str, change: &IpChange) -> Result<()>;

    /// Changes with `timestamp >= since`, newest first
    async fn get_recent_ip_changes(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IpChange>>;

    async fn get_interface_changes(
        &self,
        agent_id: &str,
        interface: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IpChange>>;

    async fn get_ip_change_summary(&self, agent_id: &str) -> Result<IpChangeSummary>;

    /// Delete metrics with `timestamp < before`, in bounded batches.
    ///
    /// `cancel` is checked between batches; a committed batch stays deleted.
    async fn cleanup(&self, before: DateTime<Utc>, cancel: &CancellationToken) -> Result<CleanupSummary>;

    async fn ping(&self) -> Result<()>;

    /// Release connections and cached statements
    async fn close(&self) -> Result<()>;

    fn stats(&self) -> StorageStats;
}
