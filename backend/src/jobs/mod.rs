// Background Jobs
//
// Scheduled with tokio-cron-scheduler. The resume job continues enrollments
// whose persisted delay has come due.

pub mod resume;
pub mod scheduler;

pub use resume::ResumeEnrollmentsJob;
pub use scheduler::{JobConfig, JobError, JobScheduler};
