// Enrollment Manager - Enrollment lifecycle and duplicate prevention

use cadence_shared::UnknownVariant;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use super::actions::Step;
use super::context::ExecutionContext;
use super::engine::WorkflowDefinition;
use super::executor::WorkflowExecutor;
use super::triggers::TriggerType;
use crate::store::{StoreError, WorkflowStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Failed => "failed",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "completed" => Ok(EnrollmentStatus::Completed),
            "failed" => Ok(EnrollmentStatus::Failed),
            "cancelled" => Ok(EnrollmentStatus::Cancelled),
            other => Err(UnknownVariant { kind: "enrollment status", value: other.to_string() }),
        }
    }
}

/// Why a client was enrolled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentReason {
    pub trigger_type: TriggerType,
    pub matched_category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentMetadata {
    pub appointment_id: Option<Uuid>,
    pub trigger_type: Option<TriggerType>,
}

/// One client's run through one workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub org_id: Uuid,
    pub workflow_id: Uuid,
    pub client_id: Uuid,
    pub status: EnrollmentStatus,
    pub reason: EnrollmentReason,
    /// Index of the next step to run. Never decreases, never exceeds `steps.len()`.
    pub current_step: i32,
    /// Steps as defined when the client was enrolled
    pub steps: Vec<Step>,
    pub context: ExecutionContext,
    /// Due time of the delay owed by the current step
    pub next_step_at: Option<DateTime<Utc>>,
    /// The delay owed by the current step has been served
    pub delay_elapsed: bool,
    /// Lease held by the run driving this enrollment. Once it lapses the
    /// resume poller may take the enrollment over.
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    pub metadata: EnrollmentMetadata,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn new(definition: &WorkflowDefinition, request: EnrollmentRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: definition.org_id,
            workflow_id: definition.id,
            client_id: request.client_id,
            status: EnrollmentStatus::Active,
            metadata: EnrollmentMetadata {
                appointment_id: request.appointment_id,
                trigger_type: Some(request.reason.trigger_type),
            },
            reason: request.reason,
            current_step: 0,
            steps: definition.ordered_steps(),
            context: request.context,
            next_step_at: None,
            delay_elapsed: false,
            claimed_until: Some(lease_expiry(now)),
            enrolled_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }

    pub fn current(&self) -> Option<&Step> {
        usize::try_from(self.current_step)
            .ok()
            .and_then(|index| self.steps.get(index))
    }

    pub fn step_count(&self) -> i32 {
        i32::try_from(self.steps.len()).unwrap_or(i32::MAX)
    }

    /// Move past the current step with the given context
    pub fn advance(mut self, context: ExecutionContext) -> Self {
        self.current_step = (self.current_step + 1).min(self.step_count());
        self.context = context;
        self.next_step_at = None;
        self.delay_elapsed = false;
        self
    }

    pub fn finish(mut self, status: EnrollmentStatus, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.completed_at = Some(at);
        self.next_step_at = None;
        self.claimed_until = None;
        self
    }

    /// Renew the run lease from `now`
    pub fn leased(mut self, now: DateTime<Utc>) -> Self {
        self.claimed_until = Some(lease_expiry(now));
        self
    }

    /// Park until `until` and give up the lease
    pub fn suspended(mut self, until: DateTime<Utc>) -> Self {
        self.next_step_at = Some(until);
        self.claimed_until = None;
        self
    }
}

/// How long a run may hold an enrollment without writing progress
pub const RUN_LEASE_MINUTES: i64 = 10;

pub fn lease_expiry(from: DateTime<Utc>) -> DateTime<Utc> {
    from.checked_add_signed(Duration::minutes(RUN_LEASE_MINUTES))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Executed,
    Skipped,
    Failed,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOutcome::Executed => "executed",
            LogOutcome::Skipped => "skipped",
            LogOutcome::Failed => "failed",
        }
    }
}

impl FromStr for LogOutcome {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executed" => Ok(LogOutcome::Executed),
            "skipped" => Ok(LogOutcome::Skipped),
            "failed" => Ok(LogOutcome::Failed),
            other => Err(UnknownVariant { kind: "log outcome", value: other.to_string() }),
        }
    }
}

/// Append-only record of one step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: Uuid,
    pub step_position: i32,
    pub outcome: LogOutcome,
    pub message: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logged_at: DateTime<Utc>,
}

impl ExecutionLogEntry {
    pub fn new(enrollment: &Enrollment, step: &Step, outcome: LogOutcome, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            step_id: step.id,
            step_position: step.position,
            outcome,
            message: message.into(),
            result: None,
            error: None,
            logged_at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Input for a single enrollment attempt
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub client_id: Uuid,
    pub context: ExecutionContext,
    pub reason: EnrollmentReason,
    pub appointment_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Enrolled within the duplicate-prevention window
    DuplicateWithinWindow { enrollment_id: Uuid, lookback_days: i64 },
    /// An active enrollment already exists for this client
    AlreadyActive { enrollment_id: Uuid },
    /// Another enrollment for this client was inserted concurrently
    ConcurrentEnrollment,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DuplicateWithinWindow { enrollment_id, lookback_days } => write!(
                f,
                "enrolled within the last {} days ({})",
                lookback_days, enrollment_id
            ),
            SkipReason::AlreadyActive { enrollment_id } => {
                write!(f, "already has active enrollment {}", enrollment_id)
            }
            SkipReason::ConcurrentEnrollment => f.write_str("enrollment created concurrently"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    Enrolled(Enrollment),
    Skipped(SkipReason),
}

type EnrollmentKey = (Uuid, Uuid);

/// Per-(client, workflow) async locks. Entries are dropped once nobody holds or awaits them.
#[derive(Default)]
pub struct EnrollmentLocks {
    inner: Mutex<HashMap<EnrollmentKey, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct EnrollmentGuard<'a> {
    locks: &'a EnrollmentLocks,
    key: EnrollmentKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EnrollmentLocks {
    pub async fn acquire(&self, client_id: Uuid, workflow_id: Uuid) -> EnrollmentGuard<'_> {
        let key = (client_id, workflow_id);
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key).or_default().clone()
        };

        EnrollmentGuard {
            locks: self,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EnrollmentGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut map = self.locks.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = map
            .get(&self.key)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            map.remove(&self.key);
        }
    }
}

/// Decides eligibility and creates enrollments
pub struct EnrollmentManager {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    locks: EnrollmentLocks,
}

impl EnrollmentManager {
    pub fn new(store: Arc<dyn WorkflowStore>, executor: Arc<WorkflowExecutor>) -> Self {
        Self {
            store,
            executor,
            locks: EnrollmentLocks::default(),
        }
    }

    /// Enroll the client unless a prior enrollment blocks it.
    /// The new enrollment starts executing on a detached task.
    pub async fn try_enroll(
        &self,
        definition: &WorkflowDefinition,
        request: EnrollmentRequest,
    ) -> Result<EnrollOutcome, StoreError> {
        let client_id = request.client_id;
        let _guard = self.locks.acquire(client_id, definition.id).await;
        let now = Utc::now();

        let policy = &definition.duplicate_prevention;
        let recent = if policy.enabled {
            let since = Duration::try_days(policy.lookback_days.max(0))
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            self.store
                .latest_enrollment_since(definition.id, client_id, since)
                .await?
        } else {
            None
        };

        let within_window = recent.is_some();
        let prior = match recent {
            Some(prior) => Some(prior),
            None => self.store.active_enrollment(definition.id, client_id).await?,
        };

        if let Some(prior) = prior {
            if !definition.restart_if_active {
                let reason = if within_window {
                    SkipReason::DuplicateWithinWindow {
                        enrollment_id: prior.id,
                        lookback_days: policy.lookback_days,
                    }
                } else {
                    SkipReason::AlreadyActive { enrollment_id: prior.id }
                };
                debug!(
                    workflow_id = %definition.id,
                    client_id = %client_id,
                    reason = %reason,
                    "Enrollment skipped"
                );
                return Ok(EnrollOutcome::Skipped(reason));
            }

            if prior.is_active() && self.store.cancel_enrollment(prior.id, now).await? {
                info!(
                    workflow_id = %definition.id,
                    client_id = %client_id,
                    enrollment_id = %prior.id,
                    "Cancelled prior enrollment for restart"
                );
            }
        }

        let enrollment = Enrollment::new(definition, request, now);
        match self.store.insert_enrollment(&enrollment).await {
            Ok(()) => {}
            Err(StoreError::Conflict(detail)) => {
                debug!(workflow_id = %definition.id, client_id = %client_id, %detail, "Enrollment conflict");
                return Ok(EnrollOutcome::Skipped(SkipReason::ConcurrentEnrollment));
            }
            Err(e) => return Err(e),
        }

        info!(
            workflow_id = %definition.id,
            workflow = %definition.name,
            client_id = %client_id,
            enrollment_id = %enrollment.id,
            "Client enrolled"
        );

        self.executor.spawn(enrollment.id);
        Ok(EnrollOutcome::Enrolled(enrollment))
    }
}
