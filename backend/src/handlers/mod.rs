use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::database;
use crate::AppState;

pub mod workflows;

pub use workflows::{event_routes, execution_routes, workflow_routes};

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database_ok = database::health_check(&state.db_pool).await;
    let stats = database::pool_stats(&state.db_pool);

    let (status, label) = if database_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(json!({
            "status": label,
            "service": "cadence",
            "database": {
                "reachable": database_ok,
                "pool": stats,
            },
        })),
    )
}
