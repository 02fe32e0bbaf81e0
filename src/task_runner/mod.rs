//! Long-running consumer that drains the task queue with a pool of workers.

mod executor;

pub use executor::ItemOutcome;
pub(crate) use executor::panic_message;

use crate::host::HostedService;
use crate::services::ServiceProvider;
use crate::task_queue::{QueueError, TaskQueue};
use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use executor::execute_work_item;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Stopped,
    Running,
    Draining,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Stopped => write!(f, "stopped"),
            RunnerState::Running => write!(f, "running"),
            RunnerState::Draining => write!(f, "draining"),
        }
    }
}

/// What `stop` does with in-flight and pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownBehavior {
    /// Stop pulling and cancel the tokens of in-flight items.
    Cancellable,
    /// Stop pulling and let in-flight items finish undisturbed.
    #[default]
    WaitForCompletion,
    /// Complete the queue and keep executing pending items until it is empty.
    DrainQueue,
}

/// Result of a `stop` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every worker exited before the deadline.
    Completed,
    /// The deadline elapsed. `abandoned` items were still queued and
    /// `interrupted` items were dropped mid-execution.
    TimedOut { abandoned: usize, interrupted: usize },
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub shutdown_behavior: ShutdownBehavior,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            shutdown_timeout: Duration::from_secs(30),
            shutdown_behavior: ShutdownBehavior::default(),
        }
    }
}

struct ActiveWorkers {
    handles: Vec<JoinHandle<()>>,
    /// Stops workers from pulling new items.
    pull_token: CancellationToken,
    /// Parent of every in-flight item's token.
    item_token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

/// Pool of workers pulling from one `TaskQueue`.
pub struct TaskRunner {
    queue: Arc<dyn TaskQueue>,
    services: Arc<ServiceProvider>,
    settings: RunnerSettings,
    state: Arc<watch::Sender<RunnerState>>,
    active: Mutex<Option<ActiveWorkers>>,
}

impl TaskRunner {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        services: Arc<ServiceProvider>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            queue,
            services,
            settings,
            state: Arc::new(watch::Sender::new(RunnerState::Stopped)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Spawn the worker loops. Cancelling `shutdown` stops new dequeues
    /// immediately and is forwarded to every in-flight item's token.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            bail!("task runner is already running");
        }

        let workers = self.settings.workers.max(1);
        let pull_token = shutdown.child_token();
        let item_token = shutdown.child_token();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let live_workers = Arc::new(AtomicUsize::new(workers));

        // Published before spawning so a worker exiting at once can't be
        // overwritten back to Running.
        self.state.send_replace(RunnerState::Running);
        let handles = (0..workers)
            .map(|worker| {
                let worker_loop = run_worker(
                    worker,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.services),
                    pull_token.clone(),
                    item_token.clone(),
                    Arc::clone(&in_flight),
                );
                let live_workers = Arc::clone(&live_workers);
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    worker_loop.await;
                    if live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                        mark_stopped_if_running(&state);
                    }
                })
            })
            .collect();

        *active = Some(ActiveWorkers {
            handles,
            pull_token,
            item_token,
            in_flight,
        });
        info!(
            "Task runner started with {} worker(s) on {} queue",
            workers,
            self.queue.kind()
        );
        Ok(())
    }

    /// Stop the workers according to the configured `ShutdownBehavior`,
    /// waiting at most `shutdown_timeout`.
    pub async fn stop(&self) -> ShutdownOutcome {
        let Some(mut active) = self.active.lock().await.take() else {
            return ShutdownOutcome::Completed;
        };

        self.state.send_replace(RunnerState::Draining);
        let behavior = self.settings.shutdown_behavior;
        info!(
            "Stopping task runner ({:?}, {} pending item(s))",
            behavior,
            self.queue.len()
        );

        match behavior {
            ShutdownBehavior::Cancellable => {
                active.pull_token.cancel();
                active.item_token.cancel();
            }
            ShutdownBehavior::WaitForCompletion => active.pull_token.cancel(),
            ShutdownBehavior::DrainQueue => self.queue.complete(),
        }

        let joined = tokio::time::timeout(
            self.settings.shutdown_timeout,
            futures::future::join_all(active.handles.iter_mut()),
        )
        .await;

        let outcome = match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Task runner worker ended abnormally: {}", e);
                    }
                }
                ShutdownOutcome::Completed
            }
            Err(_) => {
                let interrupted = active.in_flight.load(Ordering::SeqCst);
                active.pull_token.cancel();
                active.item_token.cancel();
                for handle in &active.handles {
                    handle.abort();
                }
                let abandoned = self.queue.len();
                warn!(
                    abandoned,
                    interrupted,
                    "Task runner shutdown deadline of {:?} exceeded",
                    self.settings.shutdown_timeout
                );
                ShutdownOutcome::TimedOut {
                    abandoned,
                    interrupted,
                }
            }
        };

        let pending = self.queue.len();
        if outcome == ShutdownOutcome::Completed && pending > 0 {
            info!("Task runner stopped with {} item(s) left queued", pending);
        }

        self.state.send_replace(RunnerState::Stopped);
        info!("Task runner stopped");
        outcome
    }
}

#[async_trait]
impl HostedService for TaskRunner {
    fn name(&self) -> &str {
        "task_runner"
    }

    async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        TaskRunner::start(self, shutdown).await
    }

    async fn stop(&self) -> Result<()> {
        TaskRunner::stop(self).await;
        Ok(())
    }
}

/// The last worker exited without `stop` (root cancellation, or the queue
/// was completed and drained by someone else).
fn mark_stopped_if_running(state: &watch::Sender<RunnerState>) {
    let stopped = state.send_if_modified(|current| {
        if *current == RunnerState::Running {
            *current = RunnerState::Stopped;
            true
        } else {
            false
        }
    });
    if stopped {
        warn!("All task runner workers exited, runner is no longer running");
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<dyn TaskQueue>,
    services: Arc<ServiceProvider>,
    pull_token: CancellationToken,
    item_token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
) {
    debug!(worker, "task runner worker started");

    loop {
        let item = match queue.dequeue(&pull_token).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!(worker, "task queue completed and drained");
                break;
            }
            Err(QueueError::Cancelled) => break,
            Err(e) => {
                error!(worker, "failed to dequeue work item: {}", e);
                break;
            }
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        execute_work_item(worker, item, &services, item_token.child_token()).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker, "task runner worker stopped");
}
