use crate::config::SmtpConfig;
use async_trait::async_trait;
use cadence_shared::Channel;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use super::providers::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt};

/// Email over an SMTP relay
#[derive(Debug, Clone)]
pub struct SmtpEmailProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
    priority: u32,
}

impl SmtpEmailProvider {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, ProviderError> {
        let creds = Credentials::new(
            smtp_config.username.clone(),
            smtp_config.password.clone(),
        );

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)
                .map_err(|e| ProviderError::Unavailable(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(SmtpEmailProvider {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
            priority: smtp_config.priority,
        })
    }

    fn build_message(&self, message: &OutboundMessage, message_id: &str) -> Result<Message, ProviderError> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| ProviderError::InvalidMessage(format!("sender: {}", e)))?;

        let to = match &message.to_name {
            Some(name) => format!("{} <{}>", name, message.to).parse::<Mailbox>(),
            None => message.to.parse::<Mailbox>(),
        }
        .map_err(|e| ProviderError::InvalidMessage(format!("recipient: {}", e)))?;

        let content_type = if looks_like_html(&message.body) {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone().unwrap_or_default())
            .message_id(Some(message_id.to_string()))
            .header(content_type)
            .body(message.body.clone())
            .map_err(|e| ProviderError::InvalidMessage(e.to_string()))
    }

    fn next_message_id(&self) -> String {
        let domain = self
            .from_email
            .split_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("localhost");
        format!("<{}@{}>", Uuid::new_v4(), domain)
    }
}

fn looks_like_html(body: &str) -> bool {
    let trimmed = body.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html") || body.contains("</p>")
}

#[async_trait]
impl MessageProvider for SmtpEmailProvider {
    fn name(&self) -> &str {
        "smtp"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        !self.from_email.is_empty()
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError> {
        let message_id = self.next_message_id();
        let email = self.build_message(message, &message_id)?;

        match self.transport.send(email).await {
            Ok(_) => {
                info!("Email sent successfully to {}", message.to);
                Ok(ProviderReceipt::with_id(message_id))
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", message.to, e);
                Err(ProviderError::Transport(e.to_string()))
            }
        }
    }
}
