//! Wire and domain types shared by agents and the server
//!
//! Everything here is plain data with serde derives. The JSON shapes are the
//! ones agents post to `/v1/metrics` and the ones the API returns.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Current payload schema revision
pub const SCHEMA_VERSION: u32 = 1;

/// Liveness state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            "error" => Ok(AgentStatus::Error),
            other => Err(Error::invalid_input(
                "agent_status.parse",
                format!("unknown agent status '{other}'"),
            )),
        }
    }
}

/// A reporting agent as known to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl AgentInfo {
    /// A freshly registered, online agent
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            version: String::new(),
            status: AgentStatus::Online,
            last_seen: now,
            registered_at: now,
            updated_at: now,
            port: None,
        }
    }
}

/// Kind of network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Bridge,
    Virtual,
    Tunnel,
    Bonding,
    Vlan,
}

/// Raw counters plus the rates the server derives from them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub rx_errors: u64,
    #[serde(default)]
    pub tx_errors: u64,
    #[serde(default)]
    pub rx_dropped: u64,
    #[serde(default)]
    pub tx_dropped: u64,

    /// Link speed in megabits per second, 0 when unknown
    #[serde(default)]
    pub speed_mbps: u64,
    #[serde(default)]
    pub carrier: bool,
    #[serde(default)]
    pub oper_state: String,

    // Derived by the ingestion pipeline, bytes (or packets) per second.
    #[serde(default)]
    pub rx_bytes_rate: f64,
    #[serde(default)]
    pub tx_bytes_rate: f64,
    #[serde(default)]
    pub rx_packets_rate: f64,
    #[serde(default)]
    pub tx_packets_rate: f64,
}

/// State of one interface at collection time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<InterfaceStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    Ipv4,
    Ipv6,
}

impl IpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpVersion::Ipv4 => "ipv4",
            IpVersion::Ipv6 => "ipv6",
        }
    }
}

impl FromStr for IpVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" => Ok(IpVersion::Ipv4),
            "ipv6" => Ok(IpVersion::Ipv6),
            other => Err(Error::invalid_input(
                "ip_version.parse",
                format!("unknown ip version '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Update,
    Remove,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Add => "add",
            ChangeAction::Update => "update",
            ChangeAction::Remove => "remove",
        }
    }
}

impl FromStr for ChangeAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(ChangeAction::Add),
            "update" => Ok(ChangeAction::Update),
            "remove" => Ok(ChangeAction::Remove),
            other => Err(Error::invalid_input(
                "change_action.parse",
                format!("unknown change action '{other}'"),
            )),
        }
    }
}

/// An address change detected by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpChange {
    /// Filled from the enclosing envelope when the agent leaves it empty
    #[serde(default)]
    pub agent_id: String,
    /// Empty for external address changes
    #[serde(default)]
    pub interface_name: String,
    pub version: IpVersion,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub old_addrs: Vec<String>,
    #[serde(default)]
    pub new_addrs: Vec<String>,
    pub action: ChangeAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl IpChange {
    /// Check the structural invariants of a change record
    pub fn validate(&self) -> Result<()> {
        const OP: &str = "ip_change.validate";

        if self.is_external && !self.interface_name.is_empty() {
            return Err(Error::invalid_input(
                OP,
                "external address changes must not name an interface",
            ));
        }
        if !self.is_external && self.interface_name.is_empty() {
            return Err(Error::invalid_input(OP, "interface_name is required"));
        }
        if self.old_addrs.is_empty() && self.new_addrs.is_empty() {
            return Err(Error::invalid_input(OP, "no addresses in change record"));
        }

        let consistent = match self.action {
            ChangeAction::Add => !self.new_addrs.is_empty(),
            ChangeAction::Remove => !self.old_addrs.is_empty(),
            ChangeAction::Update => !self.old_addrs.is_empty() && !self.new_addrs.is_empty(),
        };
        if !consistent {
            return Err(Error::invalid_input(
                OP,
                format!("addresses do not match action '{}'", self.action.as_str()),
            ));
        }
        Ok(())
    }
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Agent-supplied report body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_changes: Vec<IpChange>,

    /// Fields the server does not interpret, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ReportPayload {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            interfaces: BTreeMap::new(),
            external_ip: None,
            ip_changes: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// One agent report plus server-side receive metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct MetricsEnvelope {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub payload: ReportPayload,
}

impl MetricsEnvelope {
    /// Minimal envelope with an empty payload, mostly useful for tests
    pub fn new(agent_id: impl Into<String>, hostname: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            hostname: hostname.into(),
            version: String::new(),
            port: None,
            timestamp: at,
            collected_at: at,
            reported_at: at,
            created_at: None,
            payload: ReportPayload::default(),
        }
    }
}

/// Alert produced by the evaluator or the liveness monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertEvent {
    AgentOffline {
        agent: AgentInfo,
    },
    NetworkErrors {
        agent_id: String,
        interface: InterfaceSnapshot,
    },
    HighUtilization {
        agent_id: String,
        interface: InterfaceSnapshot,
        /// Percent of link capacity, present when the link speed is known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        utilization: Option<f64>,
    },
    IpChange {
        agent: AgentInfo,
        change: IpChange,
    },
}

impl AlertEvent {
    /// Template name and `X-Wameter-Event` value for this event
    pub fn event_type(&self) -> &'static str {
        match self {
            AlertEvent::AgentOffline { .. } => "agent_offline",
            AlertEvent::NetworkErrors { .. } => "network_error",
            AlertEvent::HighUtilization { .. } => "high_utilization",
            AlertEvent::IpChange { .. } => "ip_change",
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            AlertEvent::AgentOffline { agent } | AlertEvent::IpChange { agent, .. } => &agent.id,
            AlertEvent::NetworkErrors { agent_id, .. }
            | AlertEvent::HighUtilization { agent_id, .. } => agent_id,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            AlertEvent::AgentOffline { agent } | AlertEvent::IpChange { agent, .. } => {
                Some(&agent.hostname)
            }
            _ => None,
        }
    }
}
