// Workflow Engine - Entry points for events, manual runs and status queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::actions::Step;
use super::context::ExecutionContext;
use super::enrollment::{
    EnrollOutcome, EnrollmentManager, EnrollmentReason, EnrollmentRequest, EnrollmentStatus, ExecutionLogEntry,
    SkipReason,
};
use super::executor::WorkflowExecutor;
use super::triggers::{EvaluationReport, MatchConditions, TriggerEvaluator, TriggerEvent, TriggerType};
use crate::services::{MessageDeliveryService, ProviderRegistry};
use crate::store::{StoreError, Stores};

/// Whether a client may be enrolled again within a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePolicy {
    pub enabled: bool,
    pub lookback_days: i64,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            lookback_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub is_active: bool,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub match_conditions: MatchConditions,
    #[serde(default)]
    pub duplicate_prevention: DuplicatePolicy,
    /// Cancel and replace a prior enrollment instead of skipping
    #[serde(default)]
    pub restart_if_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    pub fn new(org_id: Uuid, name: &str, trigger_type: TriggerType, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            name: name.to_string(),
            description: None,
            trigger_type,
            is_active: true,
            steps,
            match_conditions: MatchConditions::default(),
            duplicate_prevention: DuplicatePolicy::default(),
            restart_if_active: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn with_duplicate_prevention(mut self, lookback_days: i64) -> Self {
        self.duplicate_prevention = DuplicatePolicy {
            enabled: true,
            lookback_days,
        };
        self
    }

    pub fn with_restart(mut self) -> Self {
        self.restart_if_active = true;
        self
    }

    pub fn with_match_conditions(mut self, match_conditions: MatchConditions) -> Self {
        self.match_conditions = match_conditions;
        self
    }

    /// Steps sorted by position
    pub fn ordered_steps(&self) -> Vec<Step> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.position);
        steps
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("workflow {0} is inactive")]
    WorkflowInactive(Uuid),

    #[error("appointment {0} not found")]
    AppointmentNotFound(Uuid),

    #[error("client {0} not found")]
    ClientNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("context is missing '{0}'")]
    MissingContext(String),

    #[error("enrollment skipped: {0}")]
    EnrollmentSkipped(SkipReason),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Current state of an enrollment and its log
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub client_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_step: i32,
    pub step_count: i32,
    pub next_step_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context: Value,
    pub log: Vec<ExecutionLogEntry>,
}

pub struct WorkflowEngine {
    stores: Stores,
    executor: Arc<WorkflowExecutor>,
    enrollments: Arc<EnrollmentManager>,
    triggers: TriggerEvaluator,
}

impl WorkflowEngine {
    pub fn new(stores: Stores, providers: ProviderRegistry) -> Self {
        let delivery = Arc::new(MessageDeliveryService::new(
            stores.templates.clone(),
            stores.records.clone(),
            stores.deliveries.clone(),
            providers,
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            stores.workflows.clone(),
            stores.records.clone(),
            delivery,
        ));
        let enrollments = Arc::new(EnrollmentManager::new(stores.workflows.clone(), executor.clone()));
        let triggers = TriggerEvaluator::new(stores.workflows.clone(), stores.records.clone(), enrollments.clone());

        Self {
            stores,
            executor,
            enrollments,
            triggers,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Handle an appointment lifecycle change. Unmapped changes are ignored.
    pub async fn on_appointment_event(
        &self,
        org_id: Uuid,
        appointment_id: Uuid,
        change_type: &str,
        metadata: Value,
    ) -> Result<EvaluationReport, WorkflowError> {
        let Some(trigger_type) = TriggerType::from_appointment_change(change_type) else {
            info!(%appointment_id, change_type, "Appointment change has no trigger; ignoring");
            return Ok(EvaluationReport::ignored());
        };

        let appointment = self
            .stores
            .records
            .get_appointment(org_id, appointment_id)
            .await?
            .ok_or(WorkflowError::AppointmentNotFound(appointment_id))?;

        let event = TriggerEvent::appointment(trigger_type, change_type, appointment).with_metadata(metadata);
        Ok(self.triggers.evaluate(&event).await?)
    }

    /// Handle a client lifecycle change. Unmapped changes are ignored.
    pub async fn on_client_event(
        &self,
        org_id: Uuid,
        client_id: Uuid,
        change_type: &str,
        metadata: Value,
    ) -> Result<EvaluationReport, WorkflowError> {
        let Some(trigger_type) = TriggerType::from_client_change(change_type) else {
            info!(%client_id, change_type, "Client change has no trigger; ignoring");
            return Ok(EvaluationReport::ignored());
        };

        let event = TriggerEvent::client(org_id, trigger_type, change_type, client_id).with_metadata(metadata);
        Ok(self.triggers.evaluate(&event).await?)
    }

    /// Enroll a client into a specific workflow. `context` must carry `client_id`.
    /// Match allow-lists are not applied; duplicate prevention is.
    pub async fn execute_workflow(
        &self,
        org_id: Uuid,
        workflow_id: Uuid,
        trigger_type: TriggerType,
        context: Value,
    ) -> Result<Uuid, WorkflowError> {
        let definition = self
            .stores
            .workflows
            .get_definition(org_id, workflow_id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))?;

        if !definition.is_active {
            return Err(WorkflowError::WorkflowInactive(workflow_id));
        }

        let supplied = ExecutionContext::from_value(context);
        let client_id = supplied
            .get_uuid("client_id")
            .ok_or_else(|| WorkflowError::MissingContext("client_id".to_string()))?;

        let client = self
            .stores
            .records
            .get_client(org_id, client_id)
            .await?
            .ok_or(WorkflowError::ClientNotFound(client_id))?;

        let category = trigger_type.as_str();
        let event = TriggerEvent::client(org_id, trigger_type, category, client_id);
        let context = event.seed_context(&client, &definition).merged(supplied.values());
        let appointment_id = context.get_uuid("appointment_id");

        let request = EnrollmentRequest {
            client_id,
            context,
            reason: EnrollmentReason {
                trigger_type,
                matched_category: category.to_string(),
            },
            appointment_id,
        };

        match self.enrollments.try_enroll(&definition, request).await? {
            EnrollOutcome::Enrolled(enrollment) => Ok(enrollment.id),
            EnrollOutcome::Skipped(reason) => Err(WorkflowError::EnrollmentSkipped(reason)),
        }
    }

    pub async fn get_execution_status(&self, execution_id: Uuid) -> Result<ExecutionStatus, WorkflowError> {
        let enrollment = self
            .stores
            .workflows
            .get_enrollment(execution_id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound(execution_id))?;

        let log = self.stores.workflows.execution_log(execution_id).await?;

        Ok(ExecutionStatus {
            execution_id,
            workflow_id: enrollment.workflow_id,
            client_id: enrollment.client_id,
            status: enrollment.status,
            current_step: enrollment.current_step,
            step_count: enrollment.step_count(),
            next_step_at: enrollment.next_step_at,
            enrolled_at: enrollment.enrolled_at,
            completed_at: enrollment.completed_at,
            context: enrollment.context.to_value(),
            log,
        })
    }

    /// Claim enrollments whose delay is due or whose run lease has lapsed, and
    /// continue them in the background
    pub async fn resume_due(&self, as_of: DateTime<Utc>, limit: i64) -> Result<usize, StoreError> {
        let due = self.stores.workflows.claim_due_enrollments(as_of, limit).await?;
        for enrollment_id in &due {
            self.executor.spawn(*enrollment_id);
        }
        if !due.is_empty() {
            info!(count = due.len(), "Resumed delayed enrollments");
        }
        Ok(due.len())
    }

    /// Wait for every in-flight enrollment run
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }
}
