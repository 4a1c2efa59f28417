//! Generic JSON webhook
//!
//! The default body is
//!
//! ```json
//! {"event_type": "...", "event_id": "...", "timestamp": "...",
//!  "agent_id": "...", "hostname": "...", "data": {...}}
//! ```
//!
//! with `common_data` merged in at the top level (event fields win). A custom
//! template registered for the webhook sink replaces that layout; it can read
//! `common_data` as `{{CommonData.key}}`, and when it renders a JSON object the
//! `common_data` keys it does not set itself are merged in as well.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{hmac_sha256, require};
use crate::config::WebhookConfig;
use crate::error::Result;
use crate::notify::template::{Escape, TemplateLoader, context, render};
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "webhook.send";

pub const EVENT_HEADER: &str = "X-Wameter-Event";
pub const DELIVERY_HEADER: &str = "X-Wameter-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Wameter-Signature";

pub struct WebhookSink {
    config: WebhookConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
}

impl WebhookSink {
    pub fn new(config: &WebhookConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        require("webhook.new", "webhook.url", &config.url)?;
        let policy = policy.with_max_retries(config.max_retries);
        Ok(Self {
            transport: HttpTransport::new("webhook.new", config.timeout, policy)?,
            config: config.clone(),
            templates,
        })
    }

    /// Request body for `event` tagged with `delivery_id`
    pub fn body(&self, event: &AlertEvent, delivery_id: &str) -> Result<String> {
        let name = event.event_type();
        if self.templates.has_override(SinkType::Webhook, name) {
            if let Some(template) = self.templates.get(SinkType::Webhook, name) {
                let mut ctx = context(event);
                if let Value::Object(map) = &mut ctx {
                    map.insert("CommonData".into(), Value::Object(self.config.common_data.clone()));
                }
                let rendered = render(&template, &ctx, Escape::None)?;
                return Ok(self.merge_common_data(rendered));
            }
        }

        let mut body = Map::new();
        for (key, value) in &self.config.common_data {
            body.insert(key.clone(), value.clone());
        }
        body.insert("event_type".into(), json!(name));
        body.insert("event_id".into(), json!(delivery_id));
        body.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        body.insert("agent_id".into(), json!(event.agent_id()));
        if let Some(hostname) = event.hostname() {
            body.insert("hostname".into(), json!(hostname));
        }
        body.insert("data".into(), serde_json::to_value(event)?);
        Ok(Value::Object(body).to_string())
    }

    fn merge_common_data(&self, rendered: String) -> String {
        if self.config.common_data.is_empty() {
            return rendered;
        }
        match serde_json::from_str::<Value>(&rendered) {
            Ok(Value::Object(mut body)) => {
                for (key, value) in &self.config.common_data {
                    body.entry(key.clone()).or_insert_with(|| value.clone());
                }
                Value::Object(body).to_string()
            }
            _ => rendered,
        }
    }

    pub fn signature(&self, body: &str) -> Result<Option<String>> {
        match self.config.secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => Ok(Some(hex::encode(hmac_sha256(secret.as_bytes(), body.as_bytes())?))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Notifier for WebhookSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Webhook
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        // One delivery id for every retry of this event.
        let delivery_id = Uuid::new_v4().to_string();
        let body = self.body(event, &delivery_id)?;
        let signature = self.signature(&body)?;

        self.transport
            .send(OP, |client| {
                let mut request = client
                    .post(&self.config.url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(EVENT_HEADER, event.event_type())
                    .header(DELIVERY_HEADER, &delivery_id);
                if let Some(signature) = &signature {
                    request = request.header(SIGNATURE_HEADER, signature);
                }
                for (name, value) in &self.config.headers {
                    request = request.header(name, value);
                }
                request.body(body.clone())
            })
            .await?;

        debug!(delivery_id, "webhook delivered");
        Ok(())
    }
}
