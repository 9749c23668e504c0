// Job Scheduler - Periodic background work for the workflow engine

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{debug, info, warn};

use super::ResumeEnrollmentsJob;
use crate::workflows::WorkflowEngine;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub resume_interval_secs: u32,
    pub resume_batch_size: i64,
    /// Upper bound on batches claimed in one tick
    pub resume_max_batches: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            resume_interval_secs: 30,
            resume_batch_size: 100,
            resume_max_batches: 10,
        }
    }
}

impl JobConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            resume_interval_secs: std::env::var("WORKFLOW_RESUME_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.resume_interval_secs),
            resume_batch_size: std::env::var("WORKFLOW_RESUME_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.resume_batch_size),
            resume_max_batches: std::env::var("WORKFLOW_RESUME_MAX_BATCHES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.resume_max_batches),
        }
    }
}

/// Six-field cron expression firing every `secs` seconds
pub fn interval_cron(secs: u32) -> JobResult<String> {
    match secs {
        0 => Err(JobError::ConfigError("interval must be positive".to_string())),
        1..=59 => Ok(format!("*/{} * * * * *", secs)),
        s if s % 60 == 0 && s / 60 < 60 => Ok(format!("0 */{} * * * *", s / 60)),
        s => Err(JobError::ConfigError(format!(
            "interval of {}s cannot be expressed as a cron schedule",
            s
        ))),
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<WorkflowEngine>,
    config: JobConfig,
}

impl JobScheduler {
    pub async fn new(engine: Arc<WorkflowEngine>, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_enrollment_resume().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_enrollment_resume(&self) -> JobResult<()> {
        let interval = self.config.resume_interval_secs;
        let cron_expr = interval_cron(interval)?;

        let engine = self.engine.clone();
        let batch_size = self.config.resume_batch_size;
        let max_batches = self.config.resume_max_batches;

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                let started_at = Utc::now();
                let job = ResumeEnrollmentsJob::new(engine, batch_size, max_batches);
                let result = job.run(started_at).await;
                let duration_ms = (Utc::now() - started_at).num_milliseconds();

                if result.errors.is_empty() {
                    debug!(resumed = result.enrollments_resumed, duration_ms, "Enrollment resume finished");
                } else {
                    warn!(
                        resumed = result.enrollments_resumed,
                        errors = result.errors.len(),
                        duration_ms,
                        "Enrollment resume finished with errors"
                    );
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!(interval_secs = interval, "Scheduled enrollment resume");

        Ok(())
    }
}
