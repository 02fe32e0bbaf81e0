use super::context::JobContext;
use super::cron::next_trigger;
use super::handle::{JobRunStatus, JobTracker};
use super::job::{CorrelationId, JobConfig, JobParams};
use super::registry::{JobBinding, JobRegistry, RegistryError, SingleInstanceGuard};
use crate::host::HostedService;
use crate::server::metrics;
use crate::services::ServiceProvider;
use crate::task_runner::{panic_message, ShutdownOutcome};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

struct ActiveLoop {
    handle: JoinHandle<ShutdownOutcome>,
    stop: CancellationToken,
}

/// Runs one configured job on its cron schedule.
///
/// Settings come from a watch channel and are re-read at the start of every
/// cycle; a change received while waiting restarts the cycle immediately.
/// Each trigger spawns an execution with its own correlation id and scope.
pub struct CronScheduler<P: JobParams> {
    name: String,
    binding: JobBinding<P>,
    settings: watch::Receiver<JobConfig<P>>,
    services: Arc<ServiceProvider>,
    tracker: Arc<JobTracker>,
    shutdown_timeout: Duration,
    active: Mutex<Option<ActiveLoop>>,
}

impl<P: JobParams> CronScheduler<P> {
    /// Fails when no handler is registered for `P`.
    pub fn new(
        registry: &JobRegistry,
        settings: watch::Receiver<JobConfig<P>>,
        services: Arc<ServiceProvider>,
    ) -> Result<Self, RegistryError> {
        let binding = registry.binding::<P>()?;
        let tracker = Arc::new(JobTracker::new(binding.job_type, Arc::clone(&binding.state)));
        let name = {
            let config = settings.borrow();
            tracker.set_settings(
                &config.job_name,
                &config.cron_expression,
                config.enabled,
                config.lock_single_instance,
            );
            format!("cron_scheduler:{}", config.job_name)
        };

        Ok(Self {
            name,
            binding,
            settings,
            services,
            tracker,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            active: Mutex::new(None),
        })
    }

    /// How long `stop` waits for running executions after cancelling them.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn tracker(&self) -> Arc<JobTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn job_name(&self) -> String {
        self.settings.borrow().job_name.clone()
    }

    pub async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            bail!("{} is already running", self.name);
        }

        let stop = shutdown.child_token();
        let job_loop = SchedulerLoop {
            binding: self.binding.clone(),
            settings: self.settings.clone(),
            settings_open: true,
            services: Arc::clone(&self.services),
            tracker: Arc::clone(&self.tracker),
            stop: stop.clone(),
            shutdown_timeout: self.shutdown_timeout,
        };
        let handle = tokio::spawn(job_loop.run());

        *active = Some(ActiveLoop { handle, stop });
        Ok(())
    }

    /// Cancel the loop and every running execution, then wait up to the
    /// shutdown timeout for the executions to return.
    pub async fn stop(&self) -> ShutdownOutcome {
        let Some(active) = self.active.lock().await.take() else {
            return ShutdownOutcome::Completed;
        };

        active.stop.cancel();
        match active.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} ended abnormally: {}", self.name, e);
                ShutdownOutcome::Completed
            }
        }
    }
}

#[async_trait]
impl<P: JobParams> HostedService for CronScheduler<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        CronScheduler::start(self, shutdown).await
    }

    async fn stop(&self) -> Result<()> {
        CronScheduler::stop(self).await;
        Ok(())
    }
}

enum Wake {
    Due,
    SettingsChanged,
    Stopped,
}

struct SchedulerLoop<P: JobParams> {
    binding: JobBinding<P>,
    settings: watch::Receiver<JobConfig<P>>,
    settings_open: bool,
    services: Arc<ServiceProvider>,
    tracker: Arc<JobTracker>,
    stop: CancellationToken,
    shutdown_timeout: Duration,
}

impl<P: JobParams> SchedulerLoop<P> {
    async fn run(mut self) -> ShutdownOutcome {
        let mut executions = JoinSet::new();
        info!(
            "Cron scheduler started for {} ({})",
            self.settings.borrow().job_name,
            self.binding.job_type
        );

        loop {
            let config = self.settings.borrow_and_update().clone();
            self.tracker.set_settings(
                &config.job_name,
                &config.cron_expression,
                config.enabled,
                config.lock_single_instance,
            );
            let chunk = config.sleep_interval();

            if !config.enabled {
                self.tracker.set_next_run(None);
                debug!("Job {} is disabled, waiting for a settings change", config.job_name);
                match self.wait_until(None, chunk, &mut executions).await {
                    Wake::Stopped => break,
                    _ => continue,
                }
            }

            let next = match next_trigger(&config.cron_expression, Utc::now()) {
                Ok(next) => next,
                Err(e) => {
                    warn!("Skipping cycle of job {}: {}", config.job_name, e);
                    metrics::record_cron_parse_error(&config.job_name);
                    self.tracker.set_next_run(None);
                    let retry_at = chrono::Duration::from_std(chunk)
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay));
                    match self.wait_until(retry_at, chunk, &mut executions).await {
                        Wake::Stopped => break,
                        _ => continue,
                    }
                }
            };

            self.tracker.set_next_run(Some(next));
            debug!("Next run of job {} at {}", config.job_name, next);

            match self.wait_until(Some(next), chunk, &mut executions).await {
                Wake::Due if !self.stop.is_cancelled() => self.trigger(&config, &mut executions),
                Wake::Due | Wake::Stopped => break,
                Wake::SettingsChanged => {
                    info!("Settings of job {} changed, rescheduling", config.job_name);
                }
            }
        }

        self.shutdown(executions).await
    }

    /// Sleep until `deadline` in chunks of at most `chunk`. Without a
    /// deadline, wait for a settings change or stop.
    async fn wait_until(
        &mut self,
        deadline: Option<DateTime<Utc>>,
        chunk: Duration,
        executions: &mut JoinSet<()>,
    ) -> Wake {
        loop {
            let sleep_for = match deadline {
                Some(deadline) => {
                    let now = Utc::now();
                    if now >= deadline {
                        return Wake::Due;
                    }
                    (deadline - now).to_std().unwrap_or(Duration::ZERO).min(chunk)
                }
                None => chunk,
            };

            let settings_closed = tokio::select! {
                _ = self.stop.cancelled() => return Wake::Stopped,
                changed = self.settings.changed(), if self.settings_open => match changed {
                    Ok(()) => return Wake::SettingsChanged,
                    Err(_) => true,
                },
                Some(joined) = executions.join_next() => {
                    log_join_result(joined);
                    false
                }
                _ = tokio::time::sleep(sleep_for) => false,
            };

            if settings_closed {
                debug!("Settings source closed, keeping the last known settings");
                self.settings_open = false;
            }
        }
    }

    fn trigger(&self, config: &JobConfig<P>, executions: &mut JoinSet<()>) {
        let lock = if config.lock_single_instance {
            match self.binding.state.try_lock() {
                Some(guard) => Some(guard),
                None => {
                    info!(
                        "Job {} is still running, skipping this trigger",
                        config.job_name
                    );
                    metrics::record_job_trigger_skipped(&config.job_name);
                    self.tracker.record_skipped();
                    return;
                }
            }
        } else {
            None
        };

        let correlation_id = CorrelationId::new();
        let span = info_span!(
            "job_execution",
            job_name = %config.job_name,
            correlation_id = %correlation_id
        );
        let execution = Execution {
            binding: self.binding.clone(),
            services: Arc::clone(&self.services),
            tracker: Arc::clone(&self.tracker),
            config: config.clone(),
            correlation_id,
            token: self.stop.child_token(),
            lock,
        };
        executions.spawn(execution.run().instrument(span));
    }

    async fn shutdown(mut self, mut executions: JoinSet<()>) -> ShutdownOutcome {
        self.tracker.set_next_run(None);
        let job_name = self.settings.borrow_and_update().job_name.clone();

        if !executions.is_empty() {
            info!(
                "Waiting for {} running execution(s) of job {}",
                executions.len(),
                job_name
            );
        }

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = executions.join_next().await {
                log_join_result(joined);
            }
        })
        .await;

        let outcome = match drained {
            Ok(()) => ShutdownOutcome::Completed,
            Err(_) => {
                let interrupted = executions.len();
                warn!(
                    interrupted,
                    "Job {} did not finish within {:?}, aborting",
                    job_name,
                    self.shutdown_timeout
                );
                executions.abort_all();
                ShutdownOutcome::TimedOut {
                    abandoned: 0,
                    interrupted,
                }
            }
        };

        info!("Cron scheduler stopped for {}", job_name);
        outcome
    }
}

fn log_join_result(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!("Job execution task ended abnormally: {}", e);
        }
    }
}

/// Decrements the running gauge when the execution ends or is aborted.
struct RunningGauge<'a>(&'a str);

impl<'a> RunningGauge<'a> {
    fn new(job: &'a str) -> Self {
        metrics::inc_job_running(job);
        Self(job)
    }
}

impl Drop for RunningGauge<'_> {
    fn drop(&mut self) {
        metrics::dec_job_running(self.0);
    }
}

struct Execution<P: JobParams> {
    binding: JobBinding<P>,
    services: Arc<ServiceProvider>,
    tracker: Arc<JobTracker>,
    config: JobConfig<P>,
    correlation_id: CorrelationId,
    token: CancellationToken,
    lock: Option<SingleInstanceGuard>,
}

impl<P: JobParams> Execution<P> {
    async fn run(self) {
        let Execution {
            binding,
            services,
            tracker,
            config,
            correlation_id,
            token,
            lock,
        } = self;
        // Released last, after the outcome is recorded.
        let _lock = lock;
        let _active = binding.state.begin_execution();
        let _gauge = RunningGauge::new(&config.job_name);

        tracker.record_started(&correlation_id, Utc::now());
        info!("Starting job {}", config.job_name);
        let start_time = Instant::now();

        let ctx = JobContext::new(
            correlation_id.clone(),
            config.job_name.clone(),
            token.clone(),
            services.create_scope(),
        );
        let result = AssertUnwindSafe(async {
            let handler = (binding.factory)(ctx.scope())?;
            handler.execute(&ctx, &config).await
        })
        .catch_unwind()
        .await;
        drop(ctx);
        let elapsed = start_time.elapsed();

        let (status, error_message) = match result {
            Ok(Ok(())) => {
                info!("Job {} completed in {:?}", config.job_name, elapsed);
                (JobRunStatus::Completed, None)
            }
            Ok(Err(e)) if token.is_cancelled() => {
                info!("Job {} was cancelled after {:?}", config.job_name, elapsed);
                (JobRunStatus::Cancelled, Some(format!("{:#}", e)))
            }
            Ok(Err(e)) => {
                error!("Job {} failed after {:?}: {:#}", config.job_name, elapsed, e);
                (JobRunStatus::Failed, Some(format!("{:#}", e)))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Job {} panicked after {:?}: {}", config.job_name, elapsed, message);
                (JobRunStatus::Panicked, Some(message))
            }
        };

        metrics::record_job_execution(&config.job_name, status.as_str(), elapsed);
        tracker.record_finished(&correlation_id, status, error_message);
    }
}
