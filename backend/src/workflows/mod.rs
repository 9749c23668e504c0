// Workflow Automation Engine
//
// Event-driven client automations: appointment and client events enroll
// clients into workflows whose steps send messages, wait, branch on
// conditions and mutate records.

pub mod actions;
pub mod conditions;
pub mod context;
pub mod engine;
pub mod enrollment;
pub mod executor;
pub mod triggers;

pub use actions::{Step, StepType};
pub use conditions::Condition;
pub use context::ExecutionContext;
pub use engine::{DuplicatePolicy, ExecutionStatus, WorkflowDefinition, WorkflowEngine, WorkflowError};
pub use enrollment::{Enrollment, EnrollmentStatus, ExecutionLogEntry, LogOutcome};
pub use executor::{RunOutcome, WorkflowExecutor};
pub use triggers::{EvaluationReport, MatchConditions, TriggerType};
