// SendGrid v3 mail API provider

use async_trait::async_trait;
use cadence_shared::Channel;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

use super::providers::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt};
use crate::config::SendGridConfig;

pub struct SendGridProvider {
    client: reqwest::Client,
    api_key: String,
    from_email: String,
    from_name: String,
    base_url: String,
    priority: u32,
}

impl SendGridProvider {
    pub fn new(config: &SendGridConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: config.api_key.clone(),
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            priority: config.priority,
        }
    }

    fn payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let mut to = json!({ "email": message.to });
        if let Some(name) = &message.to_name {
            to["name"] = json!(name);
        }

        let content_type = if message.body.contains("</") { "text/html" } else { "text/plain" };

        json!({
            "personalizations": [{ "to": [to] }],
            "from": { "email": self.from_email, "name": self.from_name },
            "subject": message.subject.clone().unwrap_or_default(),
            "content": [{ "type": content_type, "value": message.body }]
        })
    }
}

#[async_trait]
impl MessageProvider for SendGridProvider {
    fn name(&self) -> &str {
        "sendgrid"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.payload(message))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("SendGrid rejected email to {}: HTTP {}", message.to, status);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let external_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        info!("Email accepted by SendGrid for {}", message.to);
        Ok(ProviderReceipt { external_id })
    }
}
