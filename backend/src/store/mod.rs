// Persistence boundaries for the workflow engine

pub mod postgres;

pub use postgres::PgStore;

use async_trait::async_trait;
use cadence_shared::{Appointment, Client, DeliveryRecord, MessageTemplate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::workflows::enrollment::{Enrollment, ExecutionLogEntry};
use crate::workflows::{TriggerType, WorkflowDefinition};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Workflow definitions, enrollments and their execution log
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    /// Active definitions for an org listening on `trigger`
    async fn active_definitions(
        &self,
        org_id: Uuid,
        trigger: TriggerType,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    async fn get_definition(
        &self,
        org_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Most recent enrollment of the client created at or after `since`
    async fn latest_enrollment_since(
        &self,
        workflow_id: Uuid,
        client_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, StoreError>;

    async fn active_enrollment(
        &self,
        workflow_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the pair already has an active enrollment
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;

    /// Cancel if still active. Returns whether anything changed.
    async fn cancel_enrollment(&self, enrollment_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get_enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError>;

    /// Persist cursor, context, status and delay state if the enrollment is still active
    async fn save_progress(&self, enrollment: &Enrollment) -> Result<bool, StoreError>;

    /// Append `entry` and persist progress in one write. The entry is kept even when
    /// the enrollment is no longer active; the return value reports whether progress was saved.
    async fn record_step(&self, enrollment: &Enrollment, entry: &ExecutionLogEntry) -> Result<bool, StoreError>;

    /// Claim active enrollments that are due: a delay has elapsed, or the run lease of
    /// an interrupted run has lapsed. A claim takes a fresh lease, so each due
    /// enrollment is claimed once while its lease holds.
    async fn claim_due_enrollments(&self, as_of: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError>;

    async fn execution_log(&self, enrollment_id: Uuid) -> Result<Vec<ExecutionLogEntry>, StoreError>;
}

/// Clients, appointments and the records steps create
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_client(&self, org_id: Uuid, client_id: Uuid) -> Result<Option<Client>, StoreError>;

    async fn get_appointment(
        &self,
        org_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Apply one org-scoped mutation, returning the id of the affected record
    async fn mutate_record(&self, org_id: Uuid, mutation: RecordMutation) -> Result<Uuid, StoreError>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(
        &self,
        org_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<MessageTemplate>, StoreError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordMutation {
    CreateAppointment(NewAppointment),
    UpdateClient(ClientUpdate),
    CreateTask(NewTask),
    CreateNotification(NewNotification),
    CreateSocialPost(NewSocialPost),
}

impl RecordMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordMutation::CreateAppointment(_) => "create_appointment",
            RecordMutation::UpdateClient(_) => "update_client",
            RecordMutation::CreateTask(_) => "create_task",
            RecordMutation::CreateNotification(_) => "create_notification",
            RecordMutation::CreateSocialPost(_) => "create_social_post",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub client_id: Uuid,
    pub appointment_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub staff_id: Option<Uuid>,
    pub location: Option<String>,
}

/// Field changes for a client. Unknown keys land in custom fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub client_id: Uuid,
    pub fields: Map<String, Value>,
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub recipient_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSocialPost {
    pub platform: String,
    pub content: String,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// The storage handles the engine is built from
#[derive(Clone)]
pub struct Stores {
    pub workflows: Arc<dyn WorkflowStore>,
    pub records: Arc<dyn RecordStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
}

impl Stores {
    /// Use one backend for every store
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: WorkflowStore + RecordStore + TemplateStore + DeliveryStore + 'static,
    {
        Self {
            workflows: store.clone(),
            records: store.clone(),
            templates: store.clone(),
            deliveries: store,
        }
    }
}
