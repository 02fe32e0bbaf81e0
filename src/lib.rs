//! Deferred Worker Library
//!
//! In-process deferred work: a task queue drained by a pool of workers, and
//! cron-scheduled background jobs with single-instance locking and live
//! settings reload.

pub mod background_jobs;
pub mod config;
pub mod host;
pub mod server;
pub mod services;
pub mod task_queue;
pub mod task_runner;

// Re-export commonly used types for convenience
pub use background_jobs::{CronScheduler, JobConfig, JobContext, JobHandler, JobRegistry};
pub use host::{Host, HostedService};
pub use services::{Scope, ServiceProvider};
pub use task_queue::{QueueHandle, TaskQueue, WorkItem};
pub use task_runner::{RunnerSettings, TaskRunner};
