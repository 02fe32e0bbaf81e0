use super::job::CorrelationId;
use super::registry::JobExecutionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Panicked,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "success",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Cancelled => "cancelled",
            JobRunStatus::Panicked => "panic",
        }
    }
}

/// Serializable job run information.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunInfo {
    pub correlation_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: JobRunStatus,
    pub error_message: Option<String>,
}

/// Information about a scheduled job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_type: String,
    pub job_name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub lock_single_instance: bool,
    pub is_running: bool,
    pub active_executions: usize,
    pub next_run_at: Option<String>,
    pub last_run: Option<JobRunInfo>,
    pub executions: u64,
    pub skipped_triggers: u64,
}

#[derive(Debug, Default)]
struct TrackedState {
    job_name: String,
    cron_expression: String,
    enabled: bool,
    lock_single_instance: bool,
    next_run_at: Option<DateTime<Utc>>,
    last_run: Option<JobRunInfo>,
    executions: u64,
    skipped_triggers: u64,
}

/// Live status of one `CronScheduler`, written by the scheduler and read
/// through a `SchedulerHandle`.
#[derive(Debug)]
pub struct JobTracker {
    job_type: &'static str,
    execution: Arc<JobExecutionState>,
    state: Mutex<TrackedState>,
}

impl JobTracker {
    pub(crate) fn new(job_type: &'static str, execution: Arc<JobExecutionState>) -> Self {
        Self {
            job_type,
            execution,
            state: Mutex::new(TrackedState::default()),
        }
    }

    pub fn job_name(&self) -> String {
        self.lock().job_name.clone()
    }

    pub(crate) fn set_settings(
        &self,
        job_name: &str,
        cron_expression: &str,
        enabled: bool,
        lock_single_instance: bool,
    ) {
        let mut state = self.lock();
        state.job_name = job_name.to_string();
        state.cron_expression = cron_expression.to_string();
        state.enabled = enabled;
        state.lock_single_instance = lock_single_instance;
    }

    pub(crate) fn set_next_run(&self, next_run_at: Option<DateTime<Utc>>) {
        self.lock().next_run_at = next_run_at;
    }

    pub(crate) fn record_skipped(&self) {
        self.lock().skipped_triggers += 1;
    }

    pub(crate) fn record_started(&self, correlation_id: &CorrelationId, started_at: DateTime<Utc>) {
        let mut state = self.lock();
        state.executions += 1;
        state.last_run = Some(JobRunInfo {
            correlation_id: correlation_id.to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: None,
            status: JobRunStatus::Running,
            error_message: None,
        });
    }

    /// Record the end of an execution. Ignored when a newer execution has
    /// already replaced the last run.
    pub(crate) fn record_finished(
        &self,
        correlation_id: &CorrelationId,
        status: JobRunStatus,
        error_message: Option<String>,
    ) {
        let mut state = self.lock();
        if let Some(run) = state.last_run.as_mut() {
            if run.correlation_id == correlation_id.as_str() {
                run.finished_at = Some(Utc::now().to_rfc3339());
                run.status = status;
                run.error_message = error_message;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.execution.active_executions() > 0
    }

    pub fn info(&self) -> JobInfo {
        let state = self.lock();
        JobInfo {
            job_type: self.job_type.to_string(),
            job_name: state.job_name.clone(),
            cron_expression: state.cron_expression.clone(),
            enabled: state.enabled,
            lock_single_instance: state.lock_single_instance,
            is_running: self.is_running(),
            active_executions: self.execution.active_executions(),
            next_run_at: state.next_run_at.map(|dt| dt.to_rfc3339()),
            last_run: state.last_run.clone(),
            executions: state.executions,
            skipped_triggers: state.skipped_triggers,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read-only view over every scheduler, for the admin endpoints.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    trackers: Arc<RwLock<Vec<Arc<JobTracker>>>>,
}

impl SchedulerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, tracker: Arc<JobTracker>) {
        self.trackers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tracker);
    }

    /// All jobs, sorted by name.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let trackers = self.trackers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut jobs: Vec<JobInfo> = trackers.iter().map(|t| t.info()).collect();
        jobs.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        jobs
    }

    pub fn get_job(&self, job_name: &str) -> Option<JobInfo> {
        self.list_jobs().into_iter().find(|job| job.job_name == job_name)
    }

    pub fn is_job_running(&self, job_name: &str) -> bool {
        self.get_job(job_name).is_some_and(|job| job.is_running)
    }
}
