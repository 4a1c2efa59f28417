//! Row layout shared by the relational drivers
//!
//! Three tables hold everything:
//!
//! - `agents`: one row per agent, timestamps as integer nanoseconds
//! - `metrics`: one row per envelope; `timestamp`, `collected_at` and
//!   `reported_at` are copied into indexed integer columns, while `data`
//!   keeps the whole envelope as JSON so it reads back unchanged
//! - `ip_changes`: one row per change, address lists as JSON arrays
//!
//! Nanosecond integers keep range predicates exact for any timestamp an
//! agent can send (years 1677 to 2262).

use chrono::{DateTime, Utc};

use super::backend::IpChangeSummary;
use crate::error::{Error, Result};
use crate::types::IpChange;

pub const AGENT_COLUMNS: &[&str] = &[
    "id",
    "hostname",
    "version",
    "status",
    "port",
    "last_seen",
    "registered_at",
    "updated_at",
];

pub const METRIC_COLUMNS: &[&str] = &[
    "agent_id",
    "timestamp",
    "collected_at",
    "reported_at",
    "data",
    "created_at",
];

pub const IP_CHANGE_COLUMNS: &[&str] = &[
    "agent_id",
    "interface_name",
    "version",
    "is_external",
    "old_addrs",
    "new_addrs",
    "action",
    "reason",
    "timestamp",
    "created_at",
];

pub fn to_nanos(op: &'static str, dt: &DateTime<Utc>) -> Result<i64> {
    dt.timestamp_nanos_opt()
        .ok_or_else(|| Error::invalid_input(op, format!("timestamp {dt} is out of range")))
}

pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

pub fn encode_addrs(addrs: &[String]) -> Result<String> {
    Ok(serde_json::to_string(addrs)?)
}

pub fn decode_addrs(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        Error::internal("ip_changes.decode", "stored address list is not valid JSON").with_source(e)
    })
}

/// Fold a newest-first change list into a summary
pub fn summarize_changes(agent_id: &str, changes: &[IpChange]) -> IpChangeSummary {
    let mut summary = IpChangeSummary {
        agent_id: agent_id.to_string(),
        ..Default::default()
    };

    for change in changes {
        summary.total_changes += 1;
        if change.is_external {
            summary.external_changes += 1;
            if summary.current_external_ip.is_none() {
                summary.current_external_ip = change.new_addrs.first().cloned();
            }
        } else {
            *summary
                .changes_by_interface
                .entry(change.interface_name.clone())
                .or_default() += 1;
        }
        summary.last_change = Some(match summary.last_change {
            Some(last) => last.max(change.timestamp),
            None => change.timestamp,
        });
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeAction, IpVersion};
    use chrono::Duration;

    #[test]
    fn nanos_round_trip_is_exact() {
        let now = Utc::now();
        assert_eq!(from_nanos(to_nanos("t", &now).unwrap()), now);
    }

    #[test]
    fn far_future_is_rejected() {
        let far = DateTime::<Utc>::from_timestamp(32_503_680_000, 0).unwrap();
        assert!(to_nanos("t", &far).is_err());
    }

    #[test]
    fn summary_counts_by_kind() {
        let now = Utc::now();
        let change = |iface: &str, external: bool, addr: &str, age: i64| IpChange {
            agent_id: "A1".into(),
            interface_name: iface.into(),
            version: IpVersion::Ipv4,
            is_external: external,
            old_addrs: vec![],
            new_addrs: vec![addr.into()],
            action: ChangeAction::Add,
            reason: String::new(),
            timestamp: now - Duration::minutes(age),
            created_at: None,
        };
        let changes = vec![
            change("", true, "203.0.113.9", 1),
            change("eth0", false, "10.0.0.6", 2),
            change("", true, "203.0.113.1", 3),
            change("eth0", false, "10.0.0.5", 4),
        ];
        let summary = summarize_changes("A1", &changes);
        assert_eq!(summary.total_changes, 4);
        assert_eq!(summary.external_changes, 2);
        assert_eq!(summary.changes_by_interface["eth0"], 2);
        assert_eq!(summary.current_external_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(summary.last_change, Some(now - Duration::minutes(1)));
    }
}
