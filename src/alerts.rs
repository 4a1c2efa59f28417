//! Alert predicates over a single metrics report
//!
//! Evaluation is pure: it looks only at the envelope it is given (whose
//! interface rates have already been derived by ingestion) and returns the
//! events that should be sent. Nothing here does I/O.

use serde::Deserialize;

use crate::types::{AgentInfo, AlertEvent, InterfaceStats, MetricsEnvelope};

/// 100 MiB/s
pub const DEFAULT_BYTES_RATE_THRESHOLD: f64 = 100.0 * 1024.0 * 1024.0;

pub const DEFAULT_ERROR_COUNT_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Combined rx + tx error counter above which `NetworkErrors` fires
    pub error_count: u64,
    /// Per-direction byte rate above which `HighUtilization` fires
    pub bytes_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_count: DEFAULT_ERROR_COUNT_THRESHOLD,
            bytes_rate: DEFAULT_BYTES_RATE_THRESHOLD,
        }
    }
}

/// Link utilization in percent, `None` when the speed is unknown
pub fn utilization_percent(stats: &InterfaceStats) -> Option<f64> {
    if stats.speed_mbps == 0 {
        return None;
    }
    let capacity = stats.speed_mbps as f64 * 1_000_000.0 / 8.0;
    Some((stats.rx_bytes_rate + stats.tx_bytes_rate) / capacity * 100.0)
}

pub fn exceeds_error_threshold(stats: &InterfaceStats, thresholds: &AlertThresholds) -> bool {
    stats.rx_errors.saturating_add(stats.tx_errors) > thresholds.error_count
}

pub fn exceeds_rate_threshold(stats: &InterfaceStats, thresholds: &AlertThresholds) -> bool {
    stats.rx_bytes_rate > thresholds.bytes_rate || stats.tx_bytes_rate > thresholds.bytes_rate
}

/// Evaluate every predicate against one report.
///
/// `agent` is the registry view at the time of the report and is attached to
/// IP-change events so sinks can show the hostname.
pub fn evaluate(
    envelope: &MetricsEnvelope,
    agent: &AgentInfo,
    thresholds: &AlertThresholds,
) -> Vec<AlertEvent> {
    let mut events = Vec::new();

    for interface in envelope.payload.interfaces.values() {
        let Some(stats) = &interface.stats else {
            continue;
        };

        if exceeds_error_threshold(stats, thresholds) {
            events.push(AlertEvent::NetworkErrors {
                agent_id: envelope.agent_id.clone(),
                interface: interface.clone(),
            });
        }

        if exceeds_rate_threshold(stats, thresholds) {
            events.push(AlertEvent::HighUtilization {
                agent_id: envelope.agent_id.clone(),
                interface: interface.clone(),
                utilization: utilization_percent(stats),
            });
        }
    }

    for change in &envelope.payload.ip_changes {
        let mut change = change.clone();
        if change.agent_id.is_empty() {
            change.agent_id = envelope.agent_id.clone();
        }
        events.push(AlertEvent::IpChange {
            agent: agent.clone(),
            change,
        });
    }

    events
}
