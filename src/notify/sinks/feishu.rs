//! Feishu (Lark) custom bot, interactive card messages

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::instrument;

use super::{check_vendor_code, hmac_sha256, require};
use crate::config::FeishuConfig;
use crate::error::Result;
use crate::notify::template::{TemplateLoader, title};
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "feishu.send";

pub struct FeishuSink {
    config: FeishuConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
}

/// Feishu keys the HMAC with `"{ts}\n{secret}"` and signs an empty message
pub fn sign(secret: &str, timestamp_secs: i64) -> Result<String> {
    let key = format!("{timestamp_secs}\n{secret}");
    let digest = hmac_sha256(key.as_bytes(), b"")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

fn header_template(event: &AlertEvent) -> &'static str {
    match event {
        AlertEvent::AgentOffline { .. } => "red",
        AlertEvent::NetworkErrors { .. } => "orange",
        AlertEvent::HighUtilization { .. } => "yellow",
        AlertEvent::IpChange { .. } => "blue",
    }
}

impl FeishuSink {
    pub fn new(config: &FeishuConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        require("feishu.new", "feishu.webhook_url", &config.webhook_url)?;
        Ok(Self {
            transport: HttpTransport::new("feishu.new", config.timeout, policy.with_max_retries(config.max_retries))?,
            config: config.clone(),
            templates,
        })
    }

    pub fn payload(&self, event: &AlertEvent, timestamp_secs: i64) -> Result<Value> {
        let content = self.templates.render_event(SinkType::Feishu, event)?;
        let mut payload = json!({
            "msg_type": "interactive",
            "card": {
                "config": { "wide_screen_mode": true },
                "header": {
                    "title": { "tag": "plain_text", "content": title(event) },
                    "template": header_template(event),
                },
                "elements": [
                    { "tag": "markdown", "content": content },
                    { "tag": "hr" },
                    {
                        "tag": "note",
                        "elements": [
                            { "tag": "plain_text", "content": format!("agent {}", event.agent_id()) }
                        ]
                    }
                ]
            }
        });

        if let Some(secret) = self.config.secret.as_deref().filter(|s| !s.is_empty()) {
            payload["timestamp"] = json!(timestamp_secs.to_string());
            payload["sign"] = json!(sign(secret, timestamp_secs)?);
        }
        Ok(payload)
    }
}

#[async_trait]
impl Notifier for FeishuSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Feishu
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let payload = self.payload(event, Utc::now().timestamp())?;
        let body = self
            .transport
            .send_json(OP, |client| client.post(&self.config.webhook_url).json(&payload))
            .await?;
        check_vendor_code(OP, &body, "code")
    }
}
