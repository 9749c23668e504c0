// Workflow Executor - Drives an enrollment through its steps

use cadence_shared::DeliveryStatus;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::{Step, StepAction, StepError, StepOutcome};
use super::conditions;
use super::enrollment::{Enrollment, EnrollmentStatus, ExecutionLogEntry, LogOutcome};
use crate::services::delivery::{MessageDeliveryService, SendRequest};
use crate::services::templates;
use crate::store::{
    ClientUpdate, NewAppointment, NewNotification, NewSocialPost, NewTask, RecordMutation, RecordStore,
    StoreError, WorkflowStore,
};

/// How a run of an enrollment ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Waiting for a delay; the resume poller continues the run
    Suspended { until: DateTime<Utc> },
    Failed { step_id: Uuid, error: String },
    /// The enrollment was no longer active when the run reached it
    Stopped { status: EnrollmentStatus },
    NotFound,
}

pub struct WorkflowExecutor {
    workflows: Arc<dyn WorkflowStore>,
    records: Arc<dyn RecordStore>,
    delivery: Arc<MessageDeliveryService>,
    tracker: TaskTracker,
}

impl WorkflowExecutor {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        records: Arc<dyn RecordStore>,
        delivery: Arc<MessageDeliveryService>,
    ) -> Self {
        Self {
            workflows,
            records,
            delivery,
            tracker: TaskTracker::new(),
        }
    }

    /// Run the enrollment on a detached, tracked task
    pub fn spawn(self: &Arc<Self>, enrollment_id: Uuid) {
        let executor = Arc::clone(self);
        self.tracker.spawn(async move {
            match executor.run(enrollment_id, Utc::now()).await {
                Ok(outcome) => debug!(%enrollment_id, ?outcome, "Enrollment run finished"),
                Err(e) => error!(%enrollment_id, error = %e, "Enrollment run aborted"),
            }
        });
    }

    /// Wait until every spawned run has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Execute steps from the cursor until the enrollment completes, fails or suspends.
    /// `as_of` is the clock used for delay bookkeeping.
    pub async fn run(&self, enrollment_id: Uuid, as_of: DateTime<Utc>) -> Result<RunOutcome, StoreError> {
        loop {
            let Some(enrollment) = self.workflows.get_enrollment(enrollment_id).await? else {
                warn!(%enrollment_id, "Enrollment vanished before execution");
                return Ok(RunOutcome::NotFound);
            };

            if !enrollment.is_active() {
                debug!(%enrollment_id, status = %enrollment.status, "Enrollment no longer active");
                return Ok(RunOutcome::Stopped { status: enrollment.status });
            }
            let enrollment = enrollment.leased(Utc::now());

            let Some(step) = enrollment.current().cloned() else {
                let done = enrollment.finish(EnrollmentStatus::Completed, Utc::now());
                if self.workflows.save_progress(&done).await? {
                    info!(%enrollment_id, workflow_id = %done.workflow_id, "Enrollment completed");
                    return Ok(RunOutcome::Completed);
                }
                continue;
            };

            if !conditions::evaluate(&step.conditions, enrollment.context.values()) {
                let entry = ExecutionLogEntry::new(&enrollment, &step, LogOutcome::Skipped, "Step conditions not met");
                let context = enrollment.context.clone();
                self.workflows.record_step(&enrollment.advance(context), &entry).await?;
                debug!(%enrollment_id, position = step.position, "Step skipped by conditions");
                continue;
            }

            let delay = match step.pending_delay() {
                Ok(delay) => delay,
                Err(e) => return self.fail(enrollment, &step, e).await,
            };

            if let Some(delay) = delay.filter(|_| !enrollment.delay_elapsed) {
                match enrollment.next_step_at {
                    Some(due) if due <= as_of => {}
                    Some(due) => return Ok(RunOutcome::Suspended { until: due }),
                    None => match as_of.checked_add_signed(delay) {
                        Some(until) => return self.suspend(enrollment, until).await,
                        None => {
                            let err = StepError::InvalidConfig {
                                step_type: step.step_type,
                                reason: "delay runs past the end of the calendar".to_string(),
                            };
                            return self.fail(enrollment, &step, err).await;
                        }
                    },
                }
            }

            let outcome = self.execute_step(&enrollment, &step).await;
            match outcome {
                Ok(StepOutcome::Executed { message, output }) => {
                    let mut entry = ExecutionLogEntry::new(&enrollment, &step, LogOutcome::Executed, message);
                    if !output.is_empty() {
                        entry = entry.with_result(Value::Object(output.clone()));
                    }
                    let context = enrollment.context.clone().merged(&output);
                    self.workflows.record_step(&enrollment.advance(context), &entry).await?;
                    info!(%enrollment_id, position = step.position, step_type = %step.step_type, "Step executed");
                }
                Ok(StepOutcome::Skipped { message, result }) => {
                    let entry = ExecutionLogEntry::new(&enrollment, &step, LogOutcome::Skipped, message)
                        .with_result(result);
                    let context = enrollment.context.clone();
                    self.workflows.record_step(&enrollment.advance(context), &entry).await?;
                    info!(%enrollment_id, position = step.position, step_type = %step.step_type, "Step not applicable");
                }
                Err(e) => return self.fail(enrollment, &step, e).await,
            }
        }
    }

    async fn suspend(&self, enrollment: Enrollment, until: DateTime<Utc>) -> Result<RunOutcome, StoreError> {
        let enrollment = enrollment.suspended(until);
        if self.workflows.save_progress(&enrollment).await? {
            info!(enrollment_id = %enrollment.id, %until, "Enrollment waiting on delay");
            Ok(RunOutcome::Suspended { until })
        } else {
            let status = self
                .workflows
                .get_enrollment(enrollment.id)
                .await?
                .map(|e| e.status)
                .unwrap_or(EnrollmentStatus::Cancelled);
            Ok(RunOutcome::Stopped { status })
        }
    }

    async fn fail(&self, enrollment: Enrollment, step: &Step, err: StepError) -> Result<RunOutcome, StoreError> {
        error!(
            enrollment_id = %enrollment.id,
            position = step.position,
            step_type = %step.step_type,
            error = %err,
            "Step failed"
        );

        let entry = ExecutionLogEntry::new(
            &enrollment,
            step,
            LogOutcome::Failed,
            format!("{} step failed", step.step_type),
        )
        .with_error(err.to_string());

        let failed = enrollment.finish(EnrollmentStatus::Failed, Utc::now());
        self.workflows.record_step(&failed, &entry).await?;

        Ok(RunOutcome::Failed {
            step_id: step.id,
            error: err.to_string(),
        })
    }

    /// Render, decode and dispatch a single step
    async fn execute_step(&self, enrollment: &Enrollment, step: &Step) -> Result<StepOutcome, StepError> {
        let config = templates::render_value(&step.config, enrollment.context.values());
        let action = StepAction::parse(step, &config, &enrollment.context)?;
        self.execute_action(enrollment, step, action).await
    }

    async fn execute_action(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        action: StepAction,
    ) -> Result<StepOutcome, StepError> {
        let org_id = enrollment.org_id;
        let now = Utc::now();

        match action {
            StepAction::SendMessage { channel, config } => {
                let mut variables = enrollment.context.values().clone();
                for (key, value) in config.variables {
                    variables.insert(key, value);
                }

                let record = self
                    .delivery
                    .send(SendRequest {
                        org_id,
                        client_id: config.client_id,
                        template_id: config.template_id,
                        variables,
                        channel_hint: Some(channel),
                        metadata: json!({
                            "enrollment_id": enrollment.id,
                            "workflow_id": enrollment.workflow_id,
                            "step_id": step.id,
                        }),
                    })
                    .await?;

                match record.status {
                    DeliveryStatus::Sent => {
                        let provider = record.provider.clone().unwrap_or_default();
                        let mut output = Map::new();
                        output.insert(format!("{}_delivery_id", channel), json!(record.id));
                        output.insert(format!("{}_provider", channel), json!(provider));
                        Ok(StepOutcome::executed(format!("Sent {} via {}", channel, provider), output))
                    }
                    DeliveryStatus::OptedOut | DeliveryStatus::NoRecipient => Ok(StepOutcome::skipped(
                        format!("{} not sent: {}", channel, record.status),
                        json!({ "delivery_id": record.id, "status": record.status }),
                    )),
                    DeliveryStatus::Failed => Err(StepError::AllProvidersFailed {
                        channel,
                        delivery_id: record.id,
                    }),
                }
            }

            StepAction::Delay(_) => {
                let waited = step.pending_delay()?.unwrap_or_else(Duration::zero);
                Ok(StepOutcome::executed(
                    format!("Waited {} minutes", waited.num_minutes()),
                    Map::new(),
                ))
            }

            StepAction::CreateAppointment(config) => {
                let start_time = config.start_at(now)?;
                let end_time = config.end_at(start_time)?;
                let mutation = RecordMutation::CreateAppointment(NewAppointment {
                    client_id: config.client_id,
                    appointment_type: config.appointment_type.clone(),
                    start_time,
                    end_time,
                    staff_id: config.staff_id,
                    location: config.location,
                });
                let id = self.records.mutate_record(org_id, mutation).await?;
                Ok(created(
                    "created_appointment_id",
                    id,
                    format!("Created {} appointment", config.appointment_type),
                ))
            }

            StepAction::UpdateClient(config) => {
                let mutation = RecordMutation::UpdateClient(ClientUpdate {
                    client_id: config.client_id,
                    fields: config.fields,
                    add_tags: config.add_tags,
                    remove_tags: config.remove_tags,
                });
                let id = self.records.mutate_record(org_id, mutation).await?;
                Ok(created("updated_client_id", id, "Updated client"))
            }

            StepAction::CreateTask(config) => {
                let due_at = config.due_at(now)?;
                let mutation = RecordMutation::CreateTask(NewTask {
                    title: config.title.clone(),
                    description: config.description,
                    assignee_id: config.assignee_id,
                    client_id: config.client_id,
                    appointment_id: config.appointment_id,
                    due_at,
                });
                let id = self.records.mutate_record(org_id, mutation).await?;
                Ok(created("task_id", id, format!("Created task '{}'", config.title)))
            }

            StepAction::SendNotification(config) => {
                let mutation = RecordMutation::CreateNotification(NewNotification {
                    recipient_id: config.recipient_id,
                    client_id: config.client_id,
                    title: config.title.clone(),
                    message: config.message,
                });
                let id = self.records.mutate_record(org_id, mutation).await?;
                Ok(created("notification_id", id, format!("Notified staff: {}", config.title)))
            }

            StepAction::PostSocial(config) => {
                let mutation = RecordMutation::CreateSocialPost(NewSocialPost {
                    platform: config.platform.clone(),
                    content: config.content,
                    scheduled_for: config.scheduled_for,
                });
                let id = self.records.mutate_record(org_id, mutation).await?;
                Ok(created("social_post_id", id, format!("Queued {} post", config.platform)))
            }

            StepAction::Condition { result_key, conditions } => {
                let result = conditions::evaluate(&conditions, enrollment.context.values());
                let mut output = Map::new();
                output.insert(result_key.clone(), json!(result));
                Ok(StepOutcome::executed(format!("{} = {}", result_key, result), output))
            }
        }
    }
}

fn created(key: &str, id: Uuid, message: impl Into<String>) -> StepOutcome {
    let mut output = Map::new();
    output.insert(key.to_string(), json!(id));
    StepOutcome::executed(message, output)
}
