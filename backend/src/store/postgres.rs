// Postgres-backed stores

use async_trait::async_trait;
use cadence_shared::{Appointment, Client, CommunicationPreferences, DeliveryRecord, MessageTemplate};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

use super::{
    ClientUpdate, DeliveryStore, RecordMutation, RecordStore, StoreError, TemplateStore, WorkflowStore,
};
use crate::workflows::context::ExecutionContext;
use crate::workflows::enrollment::{
    lease_expiry, Enrollment, EnrollmentMetadata, EnrollmentReason, ExecutionLogEntry,
};
use crate::workflows::{MatchConditions, TriggerType, WorkflowDefinition};
use crate::workflows::engine::DuplicatePolicy;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_enum<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| StoreError::Corrupt(e.to_string()))
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

const DEFINITION_COLUMNS: &str = r#"
    id, org_id, name, description, trigger_type, is_active, steps, match_conditions,
    dedup_enabled, dedup_lookback_days, restart_if_active, created_at, updated_at
"#;

#[derive(FromRow)]
struct DefinitionRow {
    id: Uuid,
    org_id: Uuid,
    name: String,
    description: Option<String>,
    trigger_type: String,
    is_active: bool,
    steps: Value,
    match_conditions: Value,
    dedup_enabled: bool,
    dedup_lookback_days: i64,
    restart_if_active: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<DefinitionRow> for WorkflowDefinition {
    type Error = StoreError;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        Ok(WorkflowDefinition {
            id: row.id,
            org_id: row.org_id,
            name: row.name,
            description: row.description,
            trigger_type: parse_enum(&row.trigger_type)?,
            is_active: row.is_active,
            steps: serde_json::from_value(row.steps)?,
            match_conditions: serde_json::from_value::<MatchConditions>(row.match_conditions)?,
            duplicate_prevention: DuplicatePolicy {
                enabled: row.dedup_enabled,
                lookback_days: row.dedup_lookback_days,
            },
            restart_if_active: row.restart_if_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ENROLLMENT_COLUMNS: &str = r#"
    id, org_id, workflow_id, client_id, status, trigger_type, matched_category, current_step,
    steps, context, context_version, next_step_at, delay_elapsed, claimed_until, appointment_id,
    enrolled_at, completed_at
"#;

#[derive(FromRow)]
struct EnrollmentRow {
    id: Uuid,
    org_id: Uuid,
    workflow_id: Uuid,
    client_id: Uuid,
    status: String,
    trigger_type: String,
    matched_category: String,
    current_step: i32,
    steps: Value,
    context: Value,
    context_version: i64,
    next_step_at: Option<DateTime<Utc>>,
    delay_elapsed: bool,
    claimed_until: Option<DateTime<Utc>>,
    appointment_id: Option<Uuid>,
    enrolled_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        let trigger_type: TriggerType = parse_enum(&row.trigger_type)?;
        Ok(Enrollment {
            id: row.id,
            org_id: row.org_id,
            workflow_id: row.workflow_id,
            client_id: row.client_id,
            status: parse_enum(&row.status)?,
            reason: EnrollmentReason {
                trigger_type,
                matched_category: row.matched_category,
            },
            current_step: row.current_step,
            steps: serde_json::from_value(row.steps)?,
            context: ExecutionContext::restore(
                u64::try_from(row.context_version).unwrap_or_default(),
                into_object(row.context),
            ),
            next_step_at: row.next_step_at,
            delay_elapsed: row.delay_elapsed,
            claimed_until: row.claimed_until,
            metadata: EnrollmentMetadata {
                appointment_id: row.appointment_id,
                trigger_type: Some(trigger_type),
            },
            enrolled_at: row.enrolled_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    id: Uuid,
    enrollment_id: Uuid,
    step_id: Uuid,
    step_position: i32,
    outcome: String,
    message: String,
    result: Option<Value>,
    error: Option<String>,
    logged_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for ExecutionLogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(ExecutionLogEntry {
            id: row.id,
            enrollment_id: row.enrollment_id,
            step_id: row.step_id,
            step_position: row.step_position,
            outcome: parse_enum(&row.outcome)?,
            message: row.message,
            result: row.result,
            error: row.error,
            logged_at: row.logged_at,
        })
    }
}

#[derive(FromRow)]
struct ClientRow {
    id: Uuid,
    org_id: Uuid,
    first_name: String,
    last_name: Option<String>,
    email: Option<String>,
    phones: Vec<String>,
    tags: Vec<String>,
    sms_opt_out: bool,
    email_opt_out: bool,
    custom_fields: Value,
    created_at: DateTime<Utc>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            id: row.id,
            org_id: row.org_id,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            phones: row.phones,
            tags: row.tags,
            preferences: CommunicationPreferences {
                sms_opt_out: row.sms_opt_out,
                email_opt_out: row.email_opt_out,
            },
            custom_fields: row.custom_fields,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct TemplateRow {
    id: Uuid,
    org_id: Uuid,
    name: String,
    channel: String,
    subject: Option<String>,
    body: String,
    is_active: bool,
}

fn context_version(enrollment: &Enrollment) -> i64 {
    i64::try_from(enrollment.context.version()).unwrap_or(i64::MAX)
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions
            (id, org_id, name, description, trigger_type, is_active, steps, match_conditions,
             dedup_enabled, dedup_lookback_days, restart_if_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                trigger_type = EXCLUDED.trigger_type,
                is_active = EXCLUDED.is_active,
                steps = EXCLUDED.steps,
                match_conditions = EXCLUDED.match_conditions,
                dedup_enabled = EXCLUDED.dedup_enabled,
                dedup_lookback_days = EXCLUDED.dedup_lookback_days,
                restart_if_active = EXCLUDED.restart_if_active,
                updated_at = NOW()
            WHERE workflow_definitions.org_id = EXCLUDED.org_id
            "#,
        )
        .bind(definition.id)
        .bind(definition.org_id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.trigger_type.as_str())
        .bind(definition.is_active)
        .bind(serde_json::to_value(&definition.steps)?)
        .bind(serde_json::to_value(&definition.match_conditions)?)
        .bind(definition.duplicate_prevention.enabled)
        .bind(definition.duplicate_prevention.lookback_days)
        .bind(definition.restart_if_active)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_definitions(
        &self,
        org_id: Uuid,
        trigger: TriggerType,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query_as::<_, DefinitionRow>(&format!(
            "SELECT {} FROM workflow_definitions
             WHERE org_id = $1 AND trigger_type = $2 AND is_active = TRUE
             ORDER BY created_at ASC",
            DEFINITION_COLUMNS
        ))
        .bind(org_id)
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowDefinition::try_from).collect()
    }

    async fn get_definition(
        &self,
        org_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        sqlx::query_as::<_, DefinitionRow>(&format!(
            "SELECT {} FROM workflow_definitions WHERE org_id = $1 AND id = $2",
            DEFINITION_COLUMNS
        ))
        .bind(org_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .map(WorkflowDefinition::try_from)
        .transpose()
    }

    async fn latest_enrollment_since(
        &self,
        workflow_id: Uuid,
        client_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, StoreError> {
        sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {} FROM workflow_enrollments
             WHERE workflow_id = $1 AND client_id = $2 AND enrolled_at >= $3
             ORDER BY enrolled_at DESC
             LIMIT 1",
            ENROLLMENT_COLUMNS
        ))
        .bind(workflow_id)
        .bind(client_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?
        .map(Enrollment::try_from)
        .transpose()
    }

    async fn active_enrollment(
        &self,
        workflow_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError> {
        sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {} FROM workflow_enrollments
             WHERE workflow_id = $1 AND client_id = $2 AND status = 'active'",
            ENROLLMENT_COLUMNS
        ))
        .bind(workflow_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Enrollment::try_from)
        .transpose()
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_enrollments
            (id, org_id, workflow_id, client_id, status, trigger_type, matched_category, current_step,
             steps, context, context_version, next_step_at, delay_elapsed, claimed_until, appointment_id,
             enrolled_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.org_id)
        .bind(enrollment.workflow_id)
        .bind(enrollment.client_id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.reason.trigger_type.as_str())
        .bind(&enrollment.reason.matched_category)
        .bind(enrollment.current_step)
        .bind(serde_json::to_value(&enrollment.steps)?)
        .bind(enrollment.context.to_value())
        .bind(context_version(enrollment))
        .bind(enrollment.next_step_at)
        .bind(enrollment.delay_elapsed)
        .bind(enrollment.claimed_until)
        .bind(enrollment.metadata.appointment_id)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict(format!(
                "client {} already has an active enrollment in workflow {}",
                enrollment.client_id, enrollment.workflow_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel_enrollment(&self, enrollment_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_enrollments
             SET status = 'cancelled', completed_at = $2, next_step_at = NULL, claimed_until = NULL
             WHERE id = $1 AND status = 'active'",
        )
        .bind(enrollment_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {} FROM workflow_enrollments WHERE id = $1",
            ENROLLMENT_COLUMNS
        ))
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Enrollment::try_from)
        .transpose()
    }

    async fn save_progress(&self, enrollment: &Enrollment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_enrollments
            SET status = $2, current_step = $3, context = $4, context_version = $5,
                next_step_at = $6, delay_elapsed = $7, completed_at = $8, claimed_until = $9
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.current_step)
        .bind(enrollment.context.to_value())
        .bind(context_version(enrollment))
        .bind(enrollment.next_step_at)
        .bind(enrollment.delay_elapsed)
        .bind(enrollment.completed_at)
        .bind(enrollment.claimed_until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_step(&self, enrollment: &Enrollment, entry: &ExecutionLogEntry) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_execution_logs
            (id, enrollment_id, step_id, step_position, outcome, message, result, error, logged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.enrollment_id)
        .bind(entry.step_id)
        .bind(entry.step_position)
        .bind(entry.outcome.as_str())
        .bind(&entry.message)
        .bind(&entry.result)
        .bind(&entry.error)
        .bind(entry.logged_at)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_enrollments
            SET status = $2, current_step = $3, context = $4, context_version = $5,
                next_step_at = $6, delay_elapsed = $7, completed_at = $8, claimed_until = $9
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.current_step)
        .bind(enrollment.context.to_value())
        .bind(context_version(enrollment))
        .bind(enrollment.next_step_at)
        .bind(enrollment.delay_elapsed)
        .bind(enrollment.completed_at)
        .bind(enrollment.claimed_until)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        tx.commit().await?;
        Ok(updated)
    }

    async fn claim_due_enrollments(&self, as_of: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE workflow_enrollments
            SET delay_elapsed = delay_elapsed OR next_step_at IS NOT NULL,
                next_step_at = NULL,
                claimed_until = $3
            WHERE id IN (
                SELECT id FROM workflow_enrollments
                WHERE status = 'active'
                  AND (next_step_at IS NULL OR next_step_at <= $1)
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY COALESCE(next_step_at, claimed_until, enrolled_at)
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(as_of)
        .bind(limit)
        .bind(lease_expiry(as_of))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn execution_log(&self, enrollment_id: Uuid) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, enrollment_id, step_id, step_position, outcome, message, result, error, logged_at
            FROM workflow_execution_logs
            WHERE enrollment_id = $1
            ORDER BY logged_at ASC, step_position ASC
            "#,
        )
        .bind(enrollment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionLogEntry::try_from).collect()
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get_client(&self, org_id: Uuid, client_id: Uuid) -> Result<Option<Client>, StoreError> {
        let row = sqlx::query_as::<_, ClientRow>(
            r#"
            SELECT id, org_id, first_name, last_name, email, phones, tags,
                   sms_opt_out, email_opt_out, custom_fields, created_at
            FROM clients
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Client::from))
    }

    async fn get_appointment(
        &self,
        org_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Option<Appointment>, StoreError> {
        let appointment = sqlx::query_as::<_, Appointment>(
            r#"
            SELECT id, org_id, client_id, appointment_type, start_time, end_time, status, staff_id, location
            FROM appointments
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(appointment)
    }

    async fn mutate_record(&self, org_id: Uuid, mutation: RecordMutation) -> Result<Uuid, StoreError> {
        match mutation {
            RecordMutation::CreateAppointment(new) => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO appointments
                    (id, org_id, client_id, appointment_type, start_time, end_time, status, staff_id, location, created_by_workflow)
                    SELECT $1, $2, c.id, $4, $5, $6, 'scheduled', $7, $8, TRUE
                    FROM clients c WHERE c.org_id = $2 AND c.id = $3
                    "#,
                )
                .bind(id)
                .bind(org_id)
                .bind(new.client_id)
                .bind(&new.appointment_type)
                .bind(new.start_time)
                .bind(new.end_time)
                .bind(new.staff_id)
                .bind(&new.location)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)
                .and_then(|result| match result.rows_affected() {
                    0 => Err(StoreError::NotFound(format!("client {}", new.client_id))),
                    _ => Ok(id),
                })
            }

            RecordMutation::UpdateClient(update) => self.update_client(org_id, update).await,

            RecordMutation::CreateTask(task) => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO tasks (id, org_id, title, description, assignee_id, client_id, appointment_id, due_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(id)
                .bind(org_id)
                .bind(&task.title)
                .bind(&task.description)
                .bind(task.assignee_id)
                .bind(task.client_id)
                .bind(task.appointment_id)
                .bind(task.due_at)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }

            RecordMutation::CreateNotification(notification) => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO staff_notifications (id, org_id, recipient_id, client_id, title, message)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(id)
                .bind(org_id)
                .bind(notification.recipient_id)
                .bind(notification.client_id)
                .bind(&notification.title)
                .bind(&notification.message)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }

            RecordMutation::CreateSocialPost(post) => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO social_posts (id, org_id, platform, content, scheduled_for)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(id)
                .bind(org_id)
                .bind(&post.platform)
                .bind(&post.content)
                .bind(post.scheduled_for)
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
        }
    }
}

impl PgStore {
    async fn update_client(&self, org_id: Uuid, update: ClientUpdate) -> Result<Uuid, StoreError> {
        let mut custom_fields = update.fields;
        let first_name = custom_fields.remove("first_name").and_then(|v| v.as_str().map(str::to_string));
        let last_name = custom_fields.remove("last_name").and_then(|v| v.as_str().map(str::to_string));
        let email = custom_fields.remove("email").and_then(|v| v.as_str().map(str::to_string));

        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE clients SET
                first_name = COALESCE($3, first_name),
                last_name = COALESCE($4, last_name),
                email = COALESCE($5, email),
                custom_fields = custom_fields || $6,
                tags = ARRAY(
                    SELECT DISTINCT t FROM unnest(array_cat(tags, $7::text[])) AS t
                    WHERE NOT (t = ANY($8::text[]))
                ),
                updated_at = NOW()
            WHERE org_id = $1 AND id = $2
            RETURNING id
            "#,
        )
        .bind(org_id)
        .bind(update.client_id)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .bind(Value::Object(custom_fields))
        .bind(&update.add_tags)
        .bind(&update.remove_tags)
        .fetch_optional(&self.pool)
        .await?;

        id.ok_or_else(|| StoreError::NotFound(format!("client {}", update.client_id)))
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn get_template(
        &self,
        org_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<MessageTemplate>, StoreError> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, org_id, name, channel, subject, body, is_active
            FROM message_templates
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(MessageTemplate {
                id: row.id,
                org_id: row.org_id,
                name: row.name,
                channel: parse_enum(&row.channel)?,
                subject: row.subject,
                body: row.body,
                is_active: row.is_active,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO message_deliveries
            (id, org_id, template_id, client_id, channel, status, provider, external_id, scheduled_for, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.org_id)
        .bind(record.template_id)
        .bind(record.client_id)
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(&record.provider)
        .bind(&record.external_id)
        .bind(record.scheduled_for)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
