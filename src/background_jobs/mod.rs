//! Cron-driven background jobs.
//!
//! Each configured job gets its own [`CronScheduler`], which computes the
//! next trigger from the job's cron expression, waits for it, and spawns an
//! execution of the handler registered for the job's params type in the
//! [`JobRegistry`].

mod context;
pub mod cron;
mod handle;
mod job;
pub mod jobs;
mod registry;
mod scheduler;

pub use context::JobContext;
pub use cron::{next_trigger, CronParseError, CronSchedule};
pub use handle::{JobInfo, JobRunInfo, JobRunStatus, JobTracker, SchedulerHandle};
pub use job::{CorrelationId, JobConfig, JobHandler, JobParams, NoParams};
pub use registry::{
    HandlerFactory, JobBinding, JobExecutionState, JobRegistry, RegistryError,
    SingleInstanceGuard,
};
pub use scheduler::CronScheduler;
