use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiResult, AppError};
use crate::workflows::{
    Condition, DuplicatePolicy, EvaluationReport, ExecutionStatus, MatchConditions, Step, StepType,
    TriggerType, WorkflowDefinition, WorkflowError,
};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct StepInput {
    /// Defaults to the step's index in the request
    pub position: Option<i32>,
    pub step_type: StepType,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[validate(range(min = 0, max = 525600))]
    pub delay_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateWorkflowRequest {
    pub org_id: Uuid,
    #[validate(length(min = 1, max = 200, message = "name must be 1-200 characters"))]
    pub name: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[validate(length(min = 1, message = "a workflow needs at least one step"), nested)]
    pub steps: Vec<StepInput>,
    #[serde(default)]
    pub match_conditions: MatchConditions,
    /// Enables duplicate prevention over this many days
    #[validate(range(min = 1, max = 3650))]
    pub dedup_lookback_days: Option<i64>,
    #[serde(default)]
    pub restart_if_active: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl CreateWorkflowRequest {
    fn into_definition(self) -> WorkflowDefinition {
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let position = input.position.unwrap_or(i32::try_from(index).unwrap_or(i32::MAX));
                let mut step = Step::new(position, input.step_type, input.config).with_conditions(input.conditions);
                step.delay_minutes = input.delay_minutes;
                step
            })
            .collect();

        let mut definition = WorkflowDefinition::new(self.org_id, &self.name, self.trigger_type, steps)
            .with_match_conditions(self.match_conditions);
        definition.description = self.description;
        definition.is_active = self.is_active;
        definition.restart_if_active = self.restart_if_active;
        if let Some(days) = self.dedup_lookback_days {
            definition.duplicate_prevention = DuplicatePolicy {
                enabled: true,
                lookback_days: days,
            };
        }
        definition
    }
}

#[derive(Debug, Deserialize)]
pub struct OrgQuery {
    pub org_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExecuteWorkflowRequest {
    pub org_id: Uuid,
    #[serde(default = "default_trigger")]
    pub trigger_type: TriggerType,
    /// Must carry `client_id`
    #[serde(default)]
    pub context: Value,
}

fn default_trigger() -> TriggerType {
    TriggerType::Manual
}

#[derive(Debug, Serialize)]
pub struct ExecuteWorkflowResponse {
    pub execution_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppointmentEventRequest {
    pub org_id: Uuid,
    pub appointment_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub change_type: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ClientEventRequest {
    pub org_id: Uuid,
    pub client_id: Uuid,
    #[validate(length(min = 1, max = 50))]
    pub change_type: String,
    #[serde(default)]
    pub metadata: Value,
}

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_workflow))
        .route("/:id", get(get_workflow))
        .route("/:id/execute", post(execute_workflow))
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/appointments", post(appointment_event))
        .route("/clients", post(client_event))
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id", get(get_execution))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    payload.validate()?;

    let definition = payload.into_definition();
    check_step_timing(&definition)?;
    state.engine.stores().workflows.save_definition(&definition).await?;

    tracing::info!(
        workflow_id = %definition.id,
        org_id = %definition.org_id,
        trigger = %definition.trigger_type,
        steps = definition.steps.len(),
        "Workflow created"
    );

    Ok((StatusCode::CREATED, Json(definition)))
}

/// Delays and relative offsets must be schedulable before a definition is saved
fn check_step_timing(definition: &WorkflowDefinition) -> ApiResult<()> {
    let problems: Vec<String> = definition
        .steps
        .iter()
        .filter_map(|step| step.check_timing().err().map(|e| format!("step {}: {}", step.position, e)))
        .collect();

    if problems.is_empty() {
        return Ok(());
    }
    Err(AppError::ValidationError {
        details: HashMap::from([("steps".to_string(), problems)]),
    })
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<OrgQuery>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let definition = state
        .engine
        .stores()
        .workflows
        .get_definition(query.org_id, id)
        .await?
        .ok_or(WorkflowError::WorkflowNotFound(id))?;

    Ok(Json(definition))
}

async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExecuteWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<ExecuteWorkflowResponse>)> {
    payload.validate()?;

    let execution_id = state
        .engine
        .execute_workflow(payload.org_id, id, payload.trigger_type, payload.context)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(ExecuteWorkflowResponse { execution_id })))
}

async fn appointment_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AppointmentEventRequest>,
) -> ApiResult<Json<EvaluationReport>> {
    payload.validate()?;

    let report = state
        .engine
        .on_appointment_event(payload.org_id, payload.appointment_id, &payload.change_type, payload.metadata)
        .await?;

    Ok(Json(report))
}

async fn client_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ClientEventRequest>,
) -> ApiResult<Json<EvaluationReport>> {
    payload.validate()?;

    let report = state
        .engine
        .on_client_event(payload.org_id, payload.client_id, &payload.change_type, payload.metadata)
        .await?;

    Ok(Json(report))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionStatus>, AppError> {
    Ok(Json(state.engine.get_execution_status(id).await?))
}
