// Workflow Triggers - Event types that can enroll clients into workflows

use cadence_shared::{Appointment, Client, UnknownVariant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::engine::WorkflowDefinition;
use super::enrollment::{EnrollOutcome, EnrollmentManager, EnrollmentReason, EnrollmentRequest, SkipReason};
use crate::store::{RecordStore, StoreError, WorkflowStore};

/// Types of events that can trigger workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    // Appointment triggers
    AppointmentScheduled,
    AppointmentCompleted,
    AppointmentNoShow,
    AppointmentCancelled,
    AppointmentRescheduled,

    // Client triggers
    ClientCreated,
    ClientUpdated,

    // Custom triggers
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::AppointmentScheduled => "appointment_scheduled",
            TriggerType::AppointmentCompleted => "appointment_completed",
            TriggerType::AppointmentNoShow => "appointment_no_show",
            TriggerType::AppointmentCancelled => "appointment_cancelled",
            TriggerType::AppointmentRescheduled => "appointment_rescheduled",
            TriggerType::ClientCreated => "client_created",
            TriggerType::ClientUpdated => "client_updated",
            TriggerType::Manual => "manual",
        }
    }

    /// Map a raw appointment status change onto a trigger. Unknown changes map to `None`.
    pub fn from_appointment_change(change: &str) -> Option<Self> {
        match change.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "booked" => Some(TriggerType::AppointmentScheduled),
            "completed" => Some(TriggerType::AppointmentCompleted),
            "no_show" | "noshow" | "no-show" => Some(TriggerType::AppointmentNoShow),
            "cancelled" | "canceled" => Some(TriggerType::AppointmentCancelled),
            "rescheduled" => Some(TriggerType::AppointmentRescheduled),
            _ => None,
        }
    }

    /// Map a raw client change onto a trigger. Unknown changes map to `None`.
    pub fn from_client_change(change: &str) -> Option<Self> {
        match change.trim().to_ascii_lowercase().as_str() {
            "created" => Some(TriggerType::ClientCreated),
            "updated" => Some(TriggerType::ClientUpdated),
            _ => None,
        }
    }

    pub fn is_appointment_trigger(&self) -> bool {
        matches!(
            self,
            TriggerType::AppointmentScheduled
                | TriggerType::AppointmentCompleted
                | TriggerType::AppointmentNoShow
                | TriggerType::AppointmentCancelled
                | TriggerType::AppointmentRescheduled
        )
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appointment_scheduled" => Ok(TriggerType::AppointmentScheduled),
            "appointment_completed" => Ok(TriggerType::AppointmentCompleted),
            "appointment_no_show" => Ok(TriggerType::AppointmentNoShow),
            "appointment_cancelled" => Ok(TriggerType::AppointmentCancelled),
            "appointment_rescheduled" => Ok(TriggerType::AppointmentRescheduled),
            "client_created" => Ok(TriggerType::ClientCreated),
            "client_updated" => Ok(TriggerType::ClientUpdated),
            "manual" => Ok(TriggerType::Manual),
            other => Err(UnknownVariant { kind: "trigger type", value: other.to_string() }),
        }
    }
}

/// Optional allow-lists narrowing which events a definition reacts to.
/// An empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchConditions {
    #[serde(default)]
    pub appointment_types: Vec<String>,
    #[serde(default)]
    pub client_tags: Vec<String>,
}

impl MatchConditions {
    pub fn appointment_type_allowed(&self, appointment_type: Option<&str>) -> bool {
        if self.appointment_types.is_empty() {
            return true;
        }
        match appointment_type {
            Some(kind) => self.appointment_types.iter().any(|t| t.eq_ignore_ascii_case(kind)),
            None => false,
        }
    }

    pub fn client_tags_allowed(&self, client: &Client) -> bool {
        self.client_tags.is_empty() || client.has_any_tag(&self.client_tags)
    }
}

/// A business event that may enroll a client into workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub trigger_type: TriggerType,
    /// Raw change that produced the trigger (e.g. `booked`)
    pub category: String,
    pub client_id: Uuid,
    pub appointment: Option<Appointment>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(org_id: Uuid, trigger_type: TriggerType, category: &str, client_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            org_id,
            trigger_type,
            category: category.to_string(),
            client_id,
            appointment: None,
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Create an appointment lifecycle event
    pub fn appointment(trigger_type: TriggerType, category: &str, appointment: Appointment) -> Self {
        let mut event = Self::new(appointment.org_id, trigger_type, category, appointment.client_id);
        event.appointment = Some(appointment);
        event
    }

    /// Create a client lifecycle event
    pub fn client(org_id: Uuid, trigger_type: TriggerType, category: &str, client_id: Uuid) -> Self {
        Self::new(org_id, trigger_type, category, client_id)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn appointment_type(&self) -> Option<&str> {
        self.appointment.as_ref().map(|a| a.appointment_type.as_str())
    }

    /// Seed context for an enrollment created from this event
    pub fn seed_context(&self, client: &Client, definition: &WorkflowDefinition) -> ExecutionContext {
        let mut values = Map::new();
        values.insert("org_id".to_string(), json!(self.org_id));
        values.insert("client_id".to_string(), json!(client.id));
        values.insert("trigger_type".to_string(), json!(self.trigger_type));
        values.insert("workflow_id".to_string(), json!(definition.id));
        values.insert("workflow_name".to_string(), json!(definition.name));
        values.insert("client".to_string(), json!(client));
        values.insert("first_name".to_string(), json!(client.first_name));
        values.insert("last_name".to_string(), json!(client.last_name.clone().unwrap_or_default()));
        values.insert("client_name".to_string(), json!(client.full_name()));

        if let Some(appointment) = &self.appointment {
            values.insert("appointment_id".to_string(), json!(appointment.id));
            values.insert("appointment".to_string(), json!(appointment));
            values.insert("appointment_type".to_string(), json!(appointment.appointment_type));
            values.insert(
                "appointment_date".to_string(),
                json!(appointment.start_time.format("%B %-d, %Y").to_string()),
            );
            values.insert(
                "appointment_time".to_string(),
                json!(appointment.start_time.format("%-I:%M %p").to_string()),
            );
            if let Some(staff_id) = appointment.staff_id {
                values.insert("staff_id".to_string(), json!(staff_id));
            }
        }

        if !self.metadata.is_null() {
            values.insert("event".to_string(), self.metadata.clone());
        }

        ExecutionContext::new(values)
    }
}

/// Outcome of one definition considered for an event
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionFailure {
    pub workflow_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedEnrollment {
    pub workflow_id: Uuid,
    pub reason: SkipReason,
}

/// Summary of how an event was handled across all candidate definitions
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub event_id: Option<Uuid>,
    pub trigger_type: Option<TriggerType>,
    pub candidates: usize,
    pub enrolled: Vec<Uuid>,
    pub skipped: Vec<SkippedEnrollment>,
    pub filtered: Vec<Uuid>,
    pub failures: Vec<DefinitionFailure>,
}

impl EvaluationReport {
    /// Report for an event whose raw change has no trigger mapping
    pub fn ignored() -> Self {
        Self::default()
    }
}

/// Matches events to active definitions and enrolls the referenced client
pub struct TriggerEvaluator {
    workflows: Arc<dyn WorkflowStore>,
    records: Arc<dyn RecordStore>,
    enrollments: Arc<EnrollmentManager>,
}

impl TriggerEvaluator {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        records: Arc<dyn RecordStore>,
        enrollments: Arc<EnrollmentManager>,
    ) -> Self {
        Self {
            workflows,
            records,
            enrollments,
        }
    }

    /// Evaluate every active definition for the event's trigger.
    /// Failures are isolated per definition and collected in the report.
    pub async fn evaluate(&self, event: &TriggerEvent) -> Result<EvaluationReport, StoreError> {
        let definitions = self
            .workflows
            .active_definitions(event.org_id, event.trigger_type)
            .await?;

        info!(
            event_id = %event.event_id,
            trigger = %event.trigger_type,
            candidates = definitions.len(),
            "Evaluating trigger event"
        );

        let mut report = EvaluationReport {
            event_id: Some(event.event_id),
            trigger_type: Some(event.trigger_type),
            candidates: definitions.len(),
            ..Default::default()
        };

        // Client lookups are shared across definitions of the same event
        let mut clients: HashMap<Uuid, Client> = HashMap::new();

        for definition in &definitions {
            match self.evaluate_definition(event, definition, &mut clients).await {
                Ok(Some(EnrollOutcome::Enrolled(enrollment))) => report.enrolled.push(enrollment.id),
                Ok(Some(EnrollOutcome::Skipped(reason))) => report.skipped.push(SkippedEnrollment {
                    workflow_id: definition.id,
                    reason,
                }),
                Ok(None) => report.filtered.push(definition.id),
                Err(e) => {
                    warn!(workflow_id = %definition.id, error = %e, "Workflow evaluation failed");
                    report.failures.push(DefinitionFailure {
                        workflow_id: definition.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn evaluate_definition(
        &self,
        event: &TriggerEvent,
        definition: &WorkflowDefinition,
        clients: &mut HashMap<Uuid, Client>,
    ) -> Result<Option<EnrollOutcome>, StoreError> {
        if !definition.is_active || definition.trigger_type != event.trigger_type {
            return Ok(None);
        }

        if !definition.match_conditions.appointment_type_allowed(event.appointment_type()) {
            debug!(workflow_id = %definition.id, "Appointment type not in allow-list");
            return Ok(None);
        }

        let client = match clients.get(&event.client_id) {
            Some(client) => client.clone(),
            None => {
                let client = self
                    .records
                    .get_client(event.org_id, event.client_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("client {}", event.client_id)))?;
                clients.insert(client.id, client.clone());
                client
            }
        };

        if !definition.match_conditions.client_tags_allowed(&client) {
            debug!(workflow_id = %definition.id, client_id = %client.id, "Client tags not in allow-list");
            return Ok(None);
        }

        let request = EnrollmentRequest {
            client_id: client.id,
            context: event.seed_context(&client, definition),
            reason: EnrollmentReason {
                trigger_type: event.trigger_type,
                matched_category: event.category.clone(),
            },
            appointment_id: event.appointment.as_ref().map(|a| a.id),
        };

        self.enrollments.try_enroll(definition, request).await.map(Some)
    }
}
