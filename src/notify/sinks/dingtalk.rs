//! DingTalk custom robot
//!
//! When a secret is configured every request carries `timestamp` (ms) and
//! `sign` query parameters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::instrument;

use super::{check_vendor_code, require, timestamp_signature};
use crate::config::DingTalkConfig;
use crate::error::Result;
use crate::notify::template::{TemplateLoader, title};
use crate::notify::transport::{HttpTransport, RetryPolicy};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "dingtalk.send";

pub struct DingTalkSink {
    config: DingTalkConfig,
    transport: HttpTransport,
    templates: Arc<TemplateLoader>,
}

impl DingTalkSink {
    pub fn new(config: &DingTalkConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        require("dingtalk.new", "dingtalk.webhook_url", &config.webhook_url)?;
        Ok(Self {
            transport: HttpTransport::new(
                "dingtalk.new",
                config.timeout,
                policy.with_max_retries(config.max_retries),
            )?,
            config: config.clone(),
            templates,
        })
    }

    /// Webhook URL with signature parameters for `timestamp_ms`
    pub fn signed_url(&self, timestamp_ms: i64) -> Result<String> {
        let Some(secret) = self.config.secret.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(self.config.webhook_url.clone());
        };
        let sign = timestamp_signature(secret, timestamp_ms)?;
        let separator = if self.config.webhook_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{separator}timestamp={timestamp_ms}&sign={}",
            self.config.webhook_url,
            urlencoding::encode(&sign)
        ))
    }

    fn text(&self, event: &AlertEvent) -> Result<String> {
        let mut text = self.templates.render_event(SinkType::DingTalk, event)?;
        // Mobiles must appear in the text for the mention to render.
        if !self.config.at_mobiles.is_empty() {
            text.push_str("\n\n");
            for mobile in &self.config.at_mobiles {
                text.push_str(&format!("@{mobile} "));
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl Notifier for DingTalkSink {
    fn sink_type(&self) -> SinkType {
        SinkType::DingTalk
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let payload = json!({
            "msgtype": "markdown",
            "markdown": {
                "title": title(event),
                "text": self.text(event)?,
            },
            "at": {
                "atMobiles": self.config.at_mobiles,
                "isAtAll": self.config.at_all,
            }
        });
        let url = self.signed_url(Utc::now().timestamp_millis())?;

        let body = self
            .transport
            .send_json(OP, |client| client.post(&url).json(&payload))
            .await?;
        check_vendor_code(OP, &body, "errcode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(url: &str, secret: Option<&str>) -> DingTalkConfig {
        DingTalkConfig {
            enabled: true,
            webhook_url: url.into(),
            secret: secret.map(String::from),
            at_mobiles: vec![],
            at_all: false,
            timeout: Duration::from_secs(1),
            max_retries: None,
        }
    }

    fn sink(cfg: DingTalkConfig) -> DingTalkSink {
        DingTalkSink::new(&cfg, RetryPolicy::default(), Arc::new(TemplateLoader::new())).unwrap()
    }

    #[test]
    fn unsigned_url_is_untouched() {
        let url = "https://oapi.dingtalk.com/robot/send?access_token=T";
        assert_eq!(sink(config(url, None)).signed_url(1).unwrap(), url);
    }

    #[test]
    fn signed_url_appends_parameters() {
        let ts = 1_700_000_000_000;
        let url = sink(config("https://oapi.dingtalk.com/robot/send?access_token=T", Some("SEC")))
            .signed_url(ts)
            .unwrap();
        let sign = timestamp_signature("SEC", ts).unwrap();
        assert_eq!(
            url,
            format!(
                "https://oapi.dingtalk.com/robot/send?access_token=T&timestamp={ts}&sign={}",
                urlencoding::encode(&sign)
            )
        );

        let bare = sink(config("http://localhost/robot", Some("SEC"))).signed_url(ts).unwrap();
        assert!(bare.starts_with("http://localhost/robot?timestamp="));
    }
}
