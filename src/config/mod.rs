mod file_config;
pub mod reload;

pub use file_config::{FileConfig, QueueKind, TaskQueueConfig, TaskRunnerConfig};
pub use reload::ConfigReloader;

use crate::background_jobs::{JobConfig, JobParams};
use crate::task_queue::{BoundedTaskQueue, FullQueuePolicy, TaskQueue, UnboundedTaskQueue};
use crate::task_runner::{RunnerSettings, ShutdownBehavior};
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub metrics_port: u16,
    pub config_reload_interval_secs: u64,
    pub queue_kind: QueueKind,
    pub queue_capacity: Option<usize>,
    pub full_policy: FullQueuePolicy,
    pub workers: usize,
    pub shutdown_timeout_secs: u64,
    pub shutdown_behavior: ShutdownBehavior,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9091,
            config_reload_interval_secs: 5,
            queue_kind: QueueKind::Unbounded,
            queue_capacity: None,
            full_policy: FullQueuePolicy::Block,
            workers: 1,
            shutdown_timeout_secs: 30,
            shutdown_behavior: ShutdownBehavior::WaitForCompletion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskQueueSettings {
    Unbounded,
    Bounded {
        capacity: NonZeroUsize,
        policy: FullQueuePolicy,
    },
}

impl TaskQueueSettings {
    pub fn build(&self) -> Arc<dyn TaskQueue> {
        match *self {
            TaskQueueSettings::Unbounded => Arc::new(UnboundedTaskQueue::new()),
            TaskQueueSettings::Bounded { capacity, policy } => {
                Arc::new(BoundedTaskQueue::new(capacity, policy))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub metrics_port: u16,
    pub config_reload_interval: Duration,
    pub task_queue: TaskQueueSettings,
    pub task_runner: RunnerSettings,
    /// Raw `[jobs.<name>]` tables, typed on demand by [`AppConfig::job`].
    pub jobs: BTreeMap<String, toml::Value>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let reload_secs = file
            .config_reload_interval_secs
            .unwrap_or(cli.config_reload_interval_secs);
        if reload_secs == 0 {
            bail!("config_reload_interval_secs must be at least 1");
        }

        // Task queue: a capacity without an explicit kind still means bounded
        let queue_file = file.task_queue.unwrap_or_default();
        let capacity = queue_file.capacity.or(cli.queue_capacity);
        let kind = queue_file.kind.unwrap_or(if capacity.is_some() {
            QueueKind::Bounded
        } else {
            cli.queue_kind
        });
        let task_queue = match kind {
            QueueKind::Unbounded => TaskQueueSettings::Unbounded,
            QueueKind::Bounded => {
                let Some(capacity) = capacity else {
                    bail!("A bounded task queue requires a capacity");
                };
                let Some(capacity) = NonZeroUsize::new(capacity) else {
                    bail!("Task queue capacity must be at least 1");
                };
                TaskQueueSettings::Bounded {
                    capacity,
                    policy: queue_file.full_policy.unwrap_or(cli.full_policy),
                }
            }
        };

        let runner_file = file.task_runner.unwrap_or_default();
        let workers = runner_file.workers.unwrap_or(cli.workers);
        if workers == 0 {
            bail!("task_runner.workers must be at least 1");
        }
        let task_runner = RunnerSettings {
            workers,
            shutdown_timeout: Duration::from_secs(
                runner_file
                    .shutdown_timeout_secs
                    .unwrap_or(cli.shutdown_timeout_secs),
            ),
            shutdown_behavior: runner_file
                .shutdown_behavior
                .unwrap_or(cli.shutdown_behavior),
        };

        Ok(Self {
            metrics_port,
            config_reload_interval: Duration::from_secs(reload_secs),
            task_queue,
            task_runner,
            jobs: file.jobs,
        })
    }

    /// Typed settings of job `name`, or `None` if the file has no such table.
    pub fn job<P: JobParams>(&self, name: &str) -> Result<Option<JobConfig<P>>> {
        self.jobs
            .get(name)
            .map(|value| JobConfig::from_toml(name, value.clone()))
            .transpose()
    }
}
