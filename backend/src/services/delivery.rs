// Message delivery with provider fallback

use cadence_shared::{Channel, Client, DeliveryRecord, DeliveryStatus, MessageTemplate};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::providers::{OutboundMessage, ProviderRegistry};
use super::templates;
use crate::store::{DeliveryStore, RecordStore, StoreError, TemplateStore};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("template {0} not found or inactive")]
    TemplateNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One message to deliver to one client
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub org_id: Uuid,
    pub client_id: Uuid,
    pub template_id: Uuid,
    pub variables: Map<String, Value>,
    /// Overrides the template's own channel
    pub channel_hint: Option<Channel>,
    /// Copied onto the delivery record
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
struct ProviderAttempt {
    provider: String,
    error: String,
}

pub struct MessageDeliveryService {
    templates: Arc<dyn TemplateStore>,
    records: Arc<dyn RecordStore>,
    deliveries: Arc<dyn DeliveryStore>,
    providers: ProviderRegistry,
}

impl MessageDeliveryService {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        records: Arc<dyn RecordStore>,
        deliveries: Arc<dyn DeliveryStore>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            templates,
            records,
            deliveries,
            providers,
        }
    }

    /// Deliver a templated message. Exactly one [`DeliveryRecord`] is persisted
    /// unless the template cannot be loaded. A client missing from the org is
    /// recorded as `no_recipient`.
    pub async fn send(&self, request: SendRequest) -> Result<DeliveryRecord, DeliveryError> {
        let template = self
            .templates
            .get_template(request.org_id, request.template_id)
            .await?
            .filter(|t| t.is_active)
            .ok_or(DeliveryError::TemplateNotFound(request.template_id))?;

        let client = self.records.get_client(request.org_id, request.client_id).await?;

        let channel = request.channel_hint.unwrap_or(template.channel);
        let mut metadata = object_or_empty(&request.metadata);

        let (status, provider, external_id) = match &client {
            None => {
                warn!(client_id = %request.client_id, %channel, "Client not found; nothing sent");
                metadata.insert("reason".to_string(), json!("client_not_found"));
                (DeliveryStatus::NoRecipient, None, None)
            }
            Some(client) if client.preferences.opted_out_of(channel) => {
                info!(client_id = %client.id, %channel, "Client opted out; nothing sent");
                (DeliveryStatus::OptedOut, None, None)
            }
            Some(client) => match client.recipient_for(channel) {
                Some(recipient) => {
                    let message = self.compose(&template, client, channel, recipient, &request.variables, &mut metadata);
                    self.dispatch(&message, &mut metadata).await
                }
                None => {
                    info!(client_id = %client.id, %channel, "Client has no recipient address");
                    (DeliveryStatus::NoRecipient, None, None)
                }
            },
        };

        let now = Utc::now();
        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            org_id: request.org_id,
            template_id: template.id,
            client_id: request.client_id,
            channel,
            status,
            provider,
            external_id,
            scheduled_for: now,
            metadata: Value::Object(metadata),
            created_at: now,
        };

        self.deliveries.insert_delivery(&record).await?;
        Ok(record)
    }

    fn compose(
        &self,
        template: &MessageTemplate,
        client: &Client,
        channel: Channel,
        recipient: &str,
        variables: &Map<String, Value>,
        metadata: &mut Map<String, Value>,
    ) -> OutboundMessage {
        let mut merged = client_variables(client);
        for (key, value) in variables {
            merged.insert(key.clone(), value.clone());
        }

        let unresolved = templates::unresolved_placeholders(&template.body, &merged);
        if !unresolved.is_empty() {
            debug!(template_id = %template.id, ?unresolved, "Template has unresolved placeholders");
            metadata.insert("unresolved_placeholders".to_string(), json!(unresolved));
        }

        OutboundMessage {
            channel,
            to: recipient.to_string(),
            to_name: Some(client.full_name()),
            subject: match channel {
                Channel::Email => template.subject.as_deref().map(|s| templates::render(s, &merged)),
                Channel::Sms => None,
            },
            body: templates::render(&template.body, &merged),
        }
    }

    /// Try providers in priority order until one accepts the message
    async fn dispatch(
        &self,
        message: &OutboundMessage,
        metadata: &mut Map<String, Value>,
    ) -> (DeliveryStatus, Option<String>, Option<String>) {
        let mut attempts = Vec::new();
        let mut outcome = (DeliveryStatus::Failed, None, None);

        for provider in self.providers.for_channel(message.channel) {
            if !provider.is_available().await {
                debug!(provider = provider.name(), "Provider unavailable, skipping");
                attempts.push(ProviderAttempt {
                    provider: provider.name().to_string(),
                    error: "unavailable".to_string(),
                });
                continue;
            }

            match provider.send_message(message).await {
                Ok(receipt) => {
                    info!(provider = provider.name(), channel = %message.channel, "Message delivered");
                    outcome = (
                        DeliveryStatus::Sent,
                        Some(provider.name().to_string()),
                        receipt.external_id,
                    );
                    break;
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Provider failed, trying next");
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if outcome.0 == DeliveryStatus::Failed {
            warn!(channel = %message.channel, attempts = attempts.len(), "All providers failed");
        }

        metadata.insert("attempts".to_string(), json!(attempts));
        outcome
    }
}

/// Default merge fields describing the recipient
fn client_variables(client: &Client) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("first_name".to_string(), json!(client.first_name));
    vars.insert("last_name".to_string(), json!(client.last_name.clone().unwrap_or_default()));
    vars.insert("client_name".to_string(), json!(client.full_name()));
    if let Some(email) = &client.email {
        vars.insert("email".to_string(), json!(email));
    }
    if let Some(phone) = client.phones.first() {
        vars.insert("phone".to_string(), json!(phone));
    }
    vars
}

fn object_or_empty(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("context".to_string(), other.clone());
            map
        }
    }
}
