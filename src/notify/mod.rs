//! Alert fan-out to external sinks
//!
//! ## Architecture
//!
//! ```text
//! ingestion / liveness ──enqueue──▶ [bounded queue] ──▶ dispatcher
//!                                                          │ rate limiter
//!                                         ┌────────────────┼───────────────┐
//!                                         ▼                ▼               ▼
//!                                   webhook worker    email worker    slack worker ...
//! ```
//!
//! Every sink implements [`Notifier`]. The dispatcher owns the rate limiter;
//! each sink gets its own worker so a slow SMTP relay never delays a webhook.

pub mod manager;
pub mod ratelimit;
pub mod sinks;
pub mod template;
pub mod transport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::alerts::utilization_percent;
use crate::config::NotifyConfig;
use crate::error::{Error, Result};
use crate::types::{AgentInfo, AlertEvent, InterfaceSnapshot, IpChange};

pub use manager::{Notification, NotificationManager, NotifyHandle, NotifyStats, NotifyStatsSnapshot};
pub use ratelimit::RateLimiter;
pub use template::TemplateLoader;

/// Every supported sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    Email,
    Webhook,
    Slack,
    Discord,
    Telegram,
    DingTalk,
    WeChat,
    Feishu,
}

impl SinkType {
    pub const ALL: [SinkType; 8] = [
        SinkType::Email,
        SinkType::Webhook,
        SinkType::Slack,
        SinkType::Discord,
        SinkType::Telegram,
        SinkType::DingTalk,
        SinkType::WeChat,
        SinkType::Feishu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkType::Email => "email",
            SinkType::Webhook => "webhook",
            SinkType::Slack => "slack",
            SinkType::Discord => "discord",
            SinkType::Telegram => "telegram",
            SinkType::DingTalk => "dingtalk",
            SinkType::WeChat => "wechat",
            SinkType::Feishu => "feishu",
        }
    }
}

impl fmt::Display for SinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SinkType::ALL
            .into_iter()
            .find(|sink| sink.as_str() == s)
            .ok_or_else(|| Error::invalid_input("sink_type.parse", format!("unknown sink '{s}'")))
    }
}

/// Uniform contract implemented by every sink adapter.
///
/// Adapters implement [`Notifier::send`]; the per-event methods are thin
/// wrappers so callers that hold the pieces of an event do not need to build
/// one. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn sink_type(&self) -> SinkType;

    /// Render and deliver one event, retrying transient failures
    async fn send(&self, event: &AlertEvent) -> Result<()>;

    /// Cheap reachability probe
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn notify_agent_offline(&self, agent: &AgentInfo) -> Result<()> {
        self.send(&AlertEvent::AgentOffline {
            agent: agent.clone(),
        })
        .await
    }

    async fn notify_network_errors(&self, agent_id: &str, interface: &InterfaceSnapshot) -> Result<()> {
        self.send(&AlertEvent::NetworkErrors {
            agent_id: agent_id.to_string(),
            interface: interface.clone(),
        })
        .await
    }

    async fn notify_high_utilization(&self, agent_id: &str, interface: &InterfaceSnapshot) -> Result<()> {
        self.send(&AlertEvent::HighUtilization {
            agent_id: agent_id.to_string(),
            interface: interface.clone(),
            utilization: interface.stats.as_ref().and_then(utilization_percent),
        })
        .await
    }

    async fn notify_ip_change(&self, agent: &AgentInfo, change: &IpChange) -> Result<()> {
        self.send(&AlertEvent::IpChange {
            agent: agent.clone(),
            change: change.clone(),
        })
        .await
    }
}

/// Construct every enabled sink from configuration.
///
/// Fails with `InvalidConfig` when an enabled sink is missing a mandatory
/// field.
/// Retries stop waiting once `cancel` fires.
pub fn build_sinks(
    config: &NotifyConfig,
    templates: Arc<TemplateLoader>,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn Notifier>>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = Vec::new();
    let policy = transport::RetryPolicy::from_config(config).with_cancel(cancel.clone());

    if let Some(cfg) = config.email.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::email::EmailSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.webhook.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::webhook::WebhookSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.slack.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::slack::SlackSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.discord.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::discord::DiscordSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.telegram.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::telegram::TelegramSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.dingtalk.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::dingtalk::DingTalkSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.wechat.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::wechat::WeChatSink::new(cfg, policy.clone(), templates.clone())?));
    }
    if let Some(cfg) = config.feishu.as_ref().filter(|c| c.enabled) {
        sinks.push(Arc::new(sinks::feishu::FeishuSink::new(cfg, policy.clone(), templates.clone())?));
    }

    Ok(sinks)
}
