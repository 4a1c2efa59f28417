//! SMTP delivery
//!
//! Each alert goes out as one `multipart/alternative` message to every
//! configured recipient: the HTML template as the rich part, the Markdown
//! built-in as the plain-text part.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, instrument};

use super::require;
use crate::config::{EmailConfig, SmtpSecurity};
use crate::error::{Error, Result};
use crate::notify::template::{Escape, TemplateLoader, builtin_markdown, context, render, title};
use crate::notify::transport::{Attempt, RetryPolicy, with_retry};
use crate::notify::{Notifier, SinkType};
use crate::types::AlertEvent;

const OP: &str = "email.send";

/// `X-Mailer` identifying the sending server
#[derive(Debug, Clone, PartialEq)]
struct XMailer(String);

impl Header for XMailer {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Mailer")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    policy: RetryPolicy,
    templates: Arc<TemplateLoader>,
}

impl EmailSink {
    pub fn new(config: &EmailConfig, policy: RetryPolicy, templates: Arc<TemplateLoader>) -> Result<Self> {
        const NEW: &str = "email.new";
        require(NEW, "email.smtp_host", &config.smtp_host)?;
        require(NEW, "email.from", &config.from)?;
        if config.to.is_empty() {
            return Err(Error::invalid_config(NEW, "email.to needs at least one recipient"));
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| Error::invalid_config(NEW, "email.from is not an address").with_source(e))?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>().map_err(|e| {
                    Error::invalid_config(NEW, format!("'{addr}' is not an address")).with_source(e)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let relay_error = |e| Error::invalid_config(NEW, "invalid SMTP relay").with_source(e);
        let mut builder = match config.security {
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host).map_err(relay_error)?
            }
            SmtpSecurity::Tls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host).map_err(relay_error)?
            }
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host),
        };
        builder = builder.port(config.smtp_port).timeout(Some(config.timeout));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            policy: policy.with_max_retries(config.max_retries),
            templates,
        })
    }

    fn message(&self, event: &AlertEvent) -> Result<Message> {
        let html = self.templates.render_event(SinkType::Email, event)?;
        let plain = match builtin_markdown(event.event_type()) {
            Some(template) => render(template, &context(event), Escape::None)?,
            None => title(event),
        };

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("[wameter] {}", title(event)))
            .header(XMailer(concat!("wameter/", env!("CARGO_PKG_VERSION")).to_string()));
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .multipart(MultiPart::alternative_plain_html(plain, html))
            .map_err(|e| Error::internal(OP, "failed to build message").with_source(e))
    }
}

#[async_trait]
impl Notifier for EmailSink {
    fn sink_type(&self) -> SinkType {
        SinkType::Email
    }

    #[instrument(skip_all, fields(event = event.event_type(), agent_id = event.agent_id()))]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let message = self.message(event)?;

        with_retry(&self.policy, OP, |_| {
            let message = message.clone();
            async move {
                match self.transport.send(message).await {
                    Ok(response) => Attempt::Done(response),
                    Err(e) if e.is_permanent() => {
                        Attempt::Fail(Error::invalid_input(OP, "SMTP server rejected the message").with_source(e))
                    }
                    Err(e) => Attempt::Retry(Error::unavailable(OP, "SMTP delivery failed").with_source(e)),
                }
            }
        })
        .await?;

        debug!(recipients = self.to.len(), "email delivered");
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::unavailable("email.health", "SMTP server did not answer NOOP")),
            Err(e) => Err(Error::unavailable("email.health", "SMTP server unreachable").with_source(e)),
        }
    }
}
