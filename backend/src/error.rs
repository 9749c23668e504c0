//! Error envelope for the Cadence API
//!
//! Every handler failure is rendered as an [`ApiError`] body with a stable code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::store::StoreError;
use crate::workflows::WorkflowError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND", "ENROLLMENT_SKIPPED")
    pub code: String,
    pub message: String,
    /// Field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Conflict { code: &'static str, message: String },
    ValidationError { details: HashMap<String, Vec<String>> },
    BadRequest(String),
    InternalError(String),
    DatabaseError(String),
    ServiceUnavailable(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict { code, .. } => code,
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::Conflict { message, .. } => message.clone(),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!(error = %msg, "Database error");
                "A database error occurred".to_string()
            }
            Self::ServiceUnavailable(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details } = self {
            error.details = Some(details);
        }

        (status, Json(error)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(message) => Self::Conflict { code: "CONFLICT", message },
            StoreError::Unavailable(message) => Self::ServiceUnavailable(message),
            StoreError::Database(e) => Self::DatabaseError(e.to_string()),
            other => Self::InternalError(other.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::WorkflowNotFound(id) => Self::NotFound(format!("Workflow {}", id)),
            WorkflowError::AppointmentNotFound(id) => Self::NotFound(format!("Appointment {}", id)),
            WorkflowError::ClientNotFound(id) => Self::NotFound(format!("Client {}", id)),
            WorkflowError::ExecutionNotFound(id) => Self::NotFound(format!("Execution {}", id)),
            WorkflowError::WorkflowInactive(_) => Self::Conflict {
                code: "WORKFLOW_INACTIVE",
                message: err.to_string(),
            },
            WorkflowError::EnrollmentSkipped(_) => Self::Conflict {
                code: "ENROLLMENT_SKIPPED",
                message: err.to_string(),
            },
            WorkflowError::MissingContext(field) => {
                Self::BadRequest(format!("Context must include '{}'", field))
            }
            WorkflowError::Store(e) => e.into(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages = errors
                    .iter()
                    .map(|e| match &e.message {
                        Some(message) => message.to_string(),
                        None => format!("{} is invalid ({})", field, e.code),
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();
        Self::ValidationError { details }
    }
}

pub type ApiResult<T> = Result<T, AppError>;
