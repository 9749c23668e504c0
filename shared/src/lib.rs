use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a stored string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Outbound message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            other => Err(UnknownVariant { kind: "channel", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationPreferences {
    #[serde(default)]
    pub sms_opt_out: bool,
    #[serde(default)]
    pub email_opt_out: bool,
}

impl CommunicationPreferences {
    pub fn opted_out_of(&self, channel: Channel) -> bool {
        match channel {
            Channel::Sms => self.sms_opt_out,
            Channel::Email => self.email_opt_out,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub org_id: Uuid,
    pub first_name: String,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phones: Vec<String>, // ordered, first entry is primary
    pub tags: Vec<String>,
    pub preferences: CommunicationPreferences,
    pub custom_fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }

    /// Address used to reach the client on a channel, if any.
    pub fn recipient_for(&self, channel: Channel) -> Option<&str> {
        let candidate = match channel {
            Channel::Sms => self.phones.first().map(String::as_str),
            Channel::Email => self.email.as_deref(),
        };
        candidate.map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn has_any_tag(&self, allowed: &[String]) -> bool {
        self.tags.iter().any(|tag| allowed.iter().any(|a| a == tag))
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub org_id: Uuid,
    pub client_id: Uuid,
    pub appointment_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String, // scheduled, completed, no_show, cancelled
    pub staff_id: Option<Uuid>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    OptedOut,
    NoRecipient,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::OptedOut => "opted_out",
            DeliveryStatus::NoRecipient => "no_recipient",
        }
    }

    /// Expected business states where nothing was attempted.
    pub fn is_policy_block(&self) -> bool {
        matches!(self, DeliveryStatus::OptedOut | DeliveryStatus::NoRecipient)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "opted_out" => Ok(DeliveryStatus::OptedOut),
            "no_recipient" => Ok(DeliveryStatus::NoRecipient),
            other => Err(UnknownVariant { kind: "delivery status", value: other.to_string() }),
        }
    }
}

/// Final outcome of one delivery request, after provider fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub template_id: Uuid,
    pub client_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub metadata: serde_json::Value, // provider attempts, originating enrollment
    pub created_at: DateTime<Utc>,
}
