// Twilio Messages API provider

use async_trait::async_trait;
use cadence_shared::Channel;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

use super::providers::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt};
use crate::config::TwilioConfig;

pub struct TwilioSmsProvider {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
    priority: u32,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

impl TwilioSmsProvider {
    pub fn new(config: &TwilioConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            priority: config.priority,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        )
    }
}

#[async_trait]
impl MessageProvider for TwilioSmsProvider {
    fn name(&self) -> &str {
        "twilio"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.from_number.is_empty()
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError> {
        let form = [
            ("To", message.to.as_str()),
            ("From", self.from_number.as_str()),
            ("Body", message.body.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Twilio rejected SMS to {}: HTTP {}", message.to, status);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let resource: MessageResource = response.json().await?;
        info!("SMS queued by Twilio for {} ({})", message.to, resource.sid);
        Ok(ProviderReceipt::with_id(resource.sid))
    }
}
