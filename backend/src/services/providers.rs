// Delivery providers and the registry that orders them per channel

use async_trait::async_trait;
use cadence_shared::Channel;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::email::SmtpEmailProvider;
use super::sendgrid::SendGridProvider;
use super::twilio::TwilioSmsProvider;
use crate::config::Config;

/// A rendered message ready for a transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    pub to_name: Option<String>,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderReceipt {
    pub external_id: Option<String>,
}

impl ProviderReceipt {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            external_id: Some(id.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// A transport able to deliver messages on one channel
#[async_trait]
pub trait MessageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn channel(&self) -> Channel;

    /// Lower runs first
    fn priority(&self) -> u32;

    async fn is_available(&self) -> bool;

    async fn send_message(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError>;
}

/// Ordered set of providers, assembled at startup
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn MessageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configured transports
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();

        if config.smtp.is_configured() {
            match SmtpEmailProvider::new(&config.smtp) {
                Ok(provider) => registry.register(Arc::new(provider)),
                Err(e) => warn!("SMTP provider disabled: {}", e),
            }
        } else {
            warn!("SMTP is not configured; email will rely on fallback providers");
        }

        if config.sendgrid.is_configured() {
            registry.register(Arc::new(SendGridProvider::new(&config.sendgrid)));
        }

        if config.twilio.is_configured() {
            registry.register(Arc::new(TwilioSmsProvider::new(&config.twilio)));
        } else {
            warn!("Twilio is not configured; SMS steps will record failed deliveries");
        }

        for provider in &registry.providers {
            info!(
                provider = provider.name(),
                channel = %provider.channel(),
                priority = provider.priority(),
                "Registered delivery provider"
            );
        }

        registry
    }

    pub fn with_provider(mut self, provider: Arc<dyn MessageProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Insert keeping ascending priority. Equal priorities keep registration order.
    pub fn register(&mut self, provider: Arc<dyn MessageProvider>) {
        let index = self
            .providers
            .partition_point(|existing| existing.priority() <= provider.priority());
        self.providers.insert(index, provider);
    }

    /// Providers for `channel`, in the order they should be tried
    pub fn for_channel(&self, channel: Channel) -> Vec<Arc<dyn MessageProvider>> {
        self.providers
            .iter()
            .filter(|p| p.channel() == channel)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
