// Workflow Actions - Steps that workflows execute for an enrollment

use cadence_shared::Channel;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::conditions::Condition;
use super::context::ExecutionContext;
use crate::services::delivery::DeliveryError;
use crate::store::StoreError;

/// Types of steps a workflow can contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    // Messaging
    SendEmail,
    SendSms,

    // Record mutations
    CreateAppointment,
    UpdateClient,
    CreateTask,
    SendNotification,
    PostSocial,

    // Control flow
    Delay,
    Wait,
    Condition,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SendEmail => "send_email",
            StepType::SendSms => "send_sms",
            StepType::CreateAppointment => "create_appointment",
            StepType::UpdateClient => "update_client",
            StepType::CreateTask => "create_task",
            StepType::SendNotification => "send_notification",
            StepType::PostSocial => "post_social",
            StepType::Delay => "delay",
            StepType::Wait => "wait",
            StepType::Condition => "condition",
        }
    }

    /// Context keys used as defaults for missing configuration fields
    pub fn context_defaults(&self) -> &'static [&'static str] {
        match self {
            StepType::SendEmail | StepType::SendSms | StepType::UpdateClient => &["client_id"],
            StepType::CreateAppointment => &["client_id", "staff_id", "appointment_type"],
            StepType::CreateTask => &["client_id", "appointment_id"],
            StepType::SendNotification => &["client_id"],
            StepType::PostSocial | StepType::Delay | StepType::Wait | StepType::Condition => &[],
        }
    }

    pub fn is_delay_marker(&self) -> bool {
        matches!(self, StepType::Delay | StepType::Wait)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub position: i32,
    pub step_type: StepType,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Wait before running this step, whatever its type
    #[serde(default)]
    pub delay_minutes: Option<i64>,
}

impl Step {
    pub fn new(position: i32, step_type: StepType, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            step_type,
            config,
            conditions: Vec::new(),
            delay_minutes: None,
        }
    }

    pub fn send_sms(position: i32, template_id: Uuid) -> Self {
        Self::new(position, StepType::SendSms, json!({ "template_id": template_id }))
    }

    pub fn send_email(position: i32, template_id: Uuid) -> Self {
        Self::new(position, StepType::SendEmail, json!({ "template_id": template_id }))
    }

    pub fn delay(position: i32, minutes: i64) -> Self {
        Self::new(position, StepType::Delay, json!({ "minutes": minutes }))
    }

    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_delay_minutes(mut self, minutes: i64) -> Self {
        self.delay_minutes = Some(minutes);
        self
    }

    /// Total wait owed before this step runs, if any.
    pub fn pending_delay(&self) -> Result<Option<Duration>, StepError> {
        let minutes = self.delay_minutes.unwrap_or(0).max(0);
        let mut total = span(self.step_type, "delay_minutes", minutes, Duration::try_minutes)?;

        if self.step_type.is_delay_marker() {
            let config: DelayConfig = parse_config(self.step_type, self.config.clone())?;
            total = total
                .checked_add(&config.duration(self.step_type)?)
                .filter(|total| *total <= max_schedule())
                .ok_or_else(|| out_of_range(self.step_type, "delay"))?;
        }

        Ok((total > Duration::zero()).then_some(total))
    }

    /// Reject delays and relative offsets that cannot be scheduled
    pub fn check_timing(&self) -> Result<(), StepError> {
        self.pending_delay()?;

        match self.step_type {
            StepType::CreateAppointment => {
                self.check_offset("start_in_days", Duration::try_days)?;
                self.check_offset("duration_minutes", Duration::try_minutes)
            }
            StepType::CreateTask => self.check_offset("due_in_days", Duration::try_days),
            _ => Ok(()),
        }
    }

    fn check_offset(&self, field: &str, unit: fn(i64) -> Option<Duration>) -> Result<(), StepError> {
        // Templated values are checked once rendered
        match self.config.get(field).and_then(Value::as_i64) {
            Some(amount) => span(self.step_type, field, amount, unit).map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Furthest a step may schedule anything from the time it runs
pub const MAX_SCHEDULE_DAYS: i64 = 3650;

fn max_schedule() -> Duration {
    Duration::days(MAX_SCHEDULE_DAYS)
}

fn out_of_range(step_type: StepType, field: &str) -> StepError {
    StepError::InvalidConfig {
        step_type,
        reason: format!("{} is out of range (at most {} days)", field, MAX_SCHEDULE_DAYS),
    }
}

fn span(
    step_type: StepType,
    field: &str,
    amount: i64,
    unit: fn(i64) -> Option<Duration>,
) -> Result<Duration, StepError> {
    unit(amount)
        .filter(|d| d.abs() <= max_schedule())
        .ok_or_else(|| out_of_range(step_type, field))
}

fn shift(
    step_type: StepType,
    field: &str,
    from: DateTime<Utc>,
    by: Duration,
) -> Result<DateTime<Utc>, StepError> {
    from.checked_add_signed(by).ok_or_else(|| out_of_range(step_type, field))
}

/// Duration of a `delay`/`wait` step
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub days: i64,
}

impl DelayConfig {
    pub fn duration(&self, step_type: StepType) -> Result<Duration, StepError> {
        let parts = [
            span(step_type, "seconds", self.seconds, Duration::try_seconds)?,
            span(step_type, "minutes", self.minutes, Duration::try_minutes)?,
            span(step_type, "hours", self.hours, Duration::try_hours)?,
            span(step_type, "days", self.days, Duration::try_days)?,
        ];
        let total = parts
            .iter()
            .try_fold(Duration::zero(), |acc, part| acc.checked_add(part))
            .filter(|total| *total <= max_schedule())
            .ok_or_else(|| out_of_range(step_type, "delay"))?;
        Ok(total.max(Duration::zero()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessageConfig {
    pub template_id: Uuid,
    pub client_id: Uuid,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateAppointmentConfig {
    pub client_id: Uuid,
    pub appointment_type: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Schedule relative to execution time when no start time is given
    #[serde(default)]
    pub start_in_days: Option<i64>,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: i64,
    #[serde(default)]
    pub staff_id: Option<Uuid>,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_duration_minutes() -> i64 {
    60
}

impl CreateAppointmentConfig {
    pub fn start_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, StepError> {
        match (self.start_time, self.start_in_days) {
            (Some(start), _) => Ok(start),
            (None, Some(days)) => {
                let offset = span(StepType::CreateAppointment, "start_in_days", days, Duration::try_days)?;
                shift(StepType::CreateAppointment, "start_in_days", now, offset)
            }
            (None, None) => Err(StepError::MissingValue("start_time".to_string())),
        }
    }

    pub fn end_at(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>, StepError> {
        let minutes = self.duration_minutes.max(0);
        let length = span(StepType::CreateAppointment, "duration_minutes", minutes, Duration::try_minutes)?;
        shift(StepType::CreateAppointment, "duration_minutes", start, length)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateClientConfig {
    pub client_id: Uuid,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateTaskConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub appointment_id: Option<Uuid>,
    #[serde(default)]
    pub due_in_days: Option<i64>,
}

impl CreateTaskConfig {
    pub fn due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StepError> {
        self.due_in_days
            .map(|days| {
                let offset = span(StepType::CreateTask, "due_in_days", days, Duration::try_days)?;
                shift(StepType::CreateTask, "due_in_days", now, offset)
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationConfig {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub recipient_id: Option<Uuid>,
    #[serde(default)]
    pub client_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SocialPostConfig {
    pub platform: String,
    pub content: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConditionStepConfig {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub result_key: Option<String>,
}

/// A step's configuration decoded for its variant
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    SendMessage { channel: Channel, config: SendMessageConfig },
    Delay(DelayConfig),
    CreateAppointment(CreateAppointmentConfig),
    UpdateClient(UpdateClientConfig),
    CreateTask(CreateTaskConfig),
    SendNotification(NotificationConfig),
    PostSocial(SocialPostConfig),
    Condition { result_key: String, conditions: Vec<Condition> },
}

impl StepAction {
    /// Decode `config` for the step, filling missing fields from the context.
    pub fn parse(step: &Step, config: &Value, context: &ExecutionContext) -> Result<Self, StepError> {
        let config = with_context_defaults(config, context, step.step_type.context_defaults());
        let step_type = step.step_type;

        let action = match step_type {
            StepType::SendEmail => StepAction::SendMessage {
                channel: Channel::Email,
                config: parse_config(step_type, config)?,
            },
            StepType::SendSms => StepAction::SendMessage {
                channel: Channel::Sms,
                config: parse_config(step_type, config)?,
            },
            StepType::Delay | StepType::Wait => StepAction::Delay(parse_config(step_type, config)?),
            StepType::CreateAppointment => StepAction::CreateAppointment(parse_config(step_type, config)?),
            StepType::UpdateClient => StepAction::UpdateClient(parse_config(step_type, config)?),
            StepType::CreateTask => StepAction::CreateTask(parse_config(step_type, config)?),
            StepType::SendNotification => StepAction::SendNotification(parse_config(step_type, config)?),
            StepType::PostSocial => StepAction::PostSocial(parse_config(step_type, config)?),
            StepType::Condition => {
                let parsed: ConditionStepConfig = parse_config(step_type, config)?;
                StepAction::Condition {
                    result_key: parsed
                        .result_key
                        .unwrap_or_else(|| format!("condition_{}", step.position)),
                    conditions: parsed.conditions,
                }
            }
        };

        Ok(action)
    }
}

/// Overlay step configuration on context defaults. Configuration wins.
fn with_context_defaults(config: &Value, context: &ExecutionContext, keys: &[&str]) -> Value {
    let mut merged = Map::new();
    for key in keys {
        if let Some(value) = context.get(key).filter(|v| !v.is_null()) {
            merged.insert(key.to_string(), value.clone());
        }
    }

    if let Value::Object(map) = config {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }

    Value::Object(merged)
}

fn parse_config<T: DeserializeOwned>(step_type: StepType, config: Value) -> Result<T, StepError> {
    let config = if config.is_null() { json!({}) } else { config };
    serde_json::from_value(config).map_err(|e| StepError::InvalidConfig {
        step_type,
        reason: e.to_string(),
    })
}

/// Result of dispatching one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Side effect performed; `output` is merged into the context
    Executed { message: String, output: Map<String, Value> },
    /// Not applicable for this client (opted out, nothing to deliver to)
    Skipped { message: String, result: Value },
}

impl StepOutcome {
    pub fn executed(message: impl Into<String>, output: Map<String, Value>) -> Self {
        StepOutcome::Executed {
            message: message.into(),
            output,
        }
    }

    pub fn skipped(message: impl Into<String>, result: Value) -> Self {
        StepOutcome::Skipped {
            message: message.into(),
            result,
        }
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid {step_type} configuration: {reason}")]
    InvalidConfig { step_type: StepType, reason: String },

    #[error("missing required value '{0}'")]
    MissingValue(String),

    #[error("message delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("no {channel} provider accepted the message (delivery {delivery_id})")]
    AllProvidersFailed { channel: Channel, delivery_id: Uuid },

    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}
