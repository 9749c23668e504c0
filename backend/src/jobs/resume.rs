// Resume Job - Continues enrollments whose delay has come due

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error};

use crate::workflows::WorkflowEngine;

pub struct ResumeEnrollmentsJob {
    engine: Arc<WorkflowEngine>,
    batch_size: i64,
    max_batches: u32,
}

#[derive(Debug, Default)]
pub struct ResumeResult {
    pub enrollments_resumed: usize,
    pub batches: u32,
    pub errors: Vec<String>,
}

impl ResumeEnrollmentsJob {
    pub fn new(engine: Arc<WorkflowEngine>, batch_size: i64, max_batches: u32) -> Self {
        Self {
            engine,
            batch_size: batch_size.max(1),
            max_batches: max_batches.max(1),
        }
    }

    /// Claim due enrollments batch by batch until the backlog is drained
    pub async fn run(&self, as_of: DateTime<Utc>) -> ResumeResult {
        let mut result = ResumeResult::default();

        while result.batches < self.max_batches {
            result.batches += 1;
            match self.engine.resume_due(as_of, self.batch_size).await {
                Ok(claimed) => {
                    result.enrollments_resumed += claimed;
                    debug!(batch = result.batches, claimed, "Resume batch claimed");
                    if (claimed as i64) < self.batch_size {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim due enrollments");
                    result.errors.push(e.to_string());
                    break;
                }
            }
        }

        result
    }
}
