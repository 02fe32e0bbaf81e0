use anyhow::{Context, Result};
use clap::Parser;
use deferred_worker::background_jobs::jobs::{
    register_builtin_jobs, HeartbeatParams, StaleFileCleanupParams,
};
use deferred_worker::background_jobs::{
    CronScheduler, JobParams, JobRegistry, SchedulerHandle,
};
use deferred_worker::config::{AppConfig, CliConfig, ConfigReloader, FileConfig, QueueKind};
use deferred_worker::host::{shutdown_signal, Host};
use deferred_worker::server::{metrics, AdminServer, AdminState};
use deferred_worker::services::ServiceProvider;
use deferred_worker::task_queue::{FullQueuePolicy, QueueHandle, TaskQueue};
use deferred_worker::task_runner::{ShutdownBehavior, TaskRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI args, and
    /// its `[jobs.*]` tables are reloaded while running.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port for the metrics and admin server.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Seconds between checks of the config file for changes.
    #[clap(long, default_value_t = 5)]
    pub config_reload_interval_secs: u64,

    /// Task queue implementation.
    #[clap(long, value_enum, default_value_t = QueueKind::Unbounded)]
    pub queue_kind: QueueKind,

    /// Capacity of the task queue. Implies a bounded queue.
    #[clap(long)]
    pub queue_capacity: Option<usize>,

    /// What a bounded queue does when it is full.
    #[clap(long, value_enum, default_value_t = FullQueuePolicy::Block)]
    pub full_policy: FullQueuePolicy,

    /// Number of task runner workers.
    #[clap(long, default_value_t = 1)]
    pub workers: usize,

    /// Seconds to wait for in-flight work at shutdown.
    #[clap(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// What the task runner does with in-flight and pending work at shutdown.
    #[clap(long, value_enum, default_value_t = ShutdownBehavior::WaitForCompletion)]
    pub shutdown_behavior: ShutdownBehavior,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            metrics_port: self.metrics_port,
            config_reload_interval_secs: self.config_reload_interval_secs,
            queue_kind: self.queue_kind,
            queue_capacity: self.queue_capacity,
            full_policy: self.full_policy,
            workers: self.workers,
            shutdown_timeout_secs: self.shutdown_timeout_secs,
            shutdown_behavior: self.shutdown_behavior,
        }
    }
}

/// Builds one `CronScheduler` per configured job and registers it with the host.
struct JobWiring<'a> {
    config: &'a AppConfig,
    registry: &'a JobRegistry,
    services: &'a Arc<ServiceProvider>,
    reloader: Option<&'a mut ConfigReloader>,
    handle: &'a SchedulerHandle,
    host: &'a mut Host,
    scheduled: Vec<String>,
}

impl JobWiring<'_> {
    fn schedule<P: JobParams>(&mut self, name: &str) -> Result<()> {
        let Some(initial) = self.config.job::<P>(name)? else {
            return Ok(());
        };
        let settings = match self.reloader.as_deref_mut() {
            Some(reloader) => reloader.watch_job(name, initial),
            None => watch::channel(initial).1,
        };

        let scheduler = CronScheduler::new(self.registry, settings, Arc::clone(self.services))
            .with_context(|| format!("Cannot schedule job {}", name))?
            .with_shutdown_timeout(self.config.task_runner.shutdown_timeout);
        self.handle.attach(scheduler.tracker());
        self.host.add(Arc::new(scheduler));
        self.scheduled.push(name.to_string());
        info!("Scheduled job {}", name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    metrics::init_metrics();

    let mut host = Host::new();
    let root = host.shutdown_token();

    let queue = config.task_queue.build();
    info!("Using {} task queue", queue.kind());
    let services = ServiceProvider::builder()
        .add_singleton(Arc::new(QueueHandle::new(Arc::clone(&queue), root.clone())))
        .build();

    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&queue),
        Arc::clone(&services),
        config.task_runner.clone(),
    ));
    host.add(runner.clone());

    let mut registry = JobRegistry::new();
    register_builtin_jobs(&mut registry)?;

    let mut reloader = cli_args
        .config
        .as_ref()
        .map(|path| ConfigReloader::new(path, config.config_reload_interval));
    let scheduler_handle = SchedulerHandle::new();
    let scheduled = {
        let mut wiring = JobWiring {
            config: &config,
            registry: &registry,
            services: &services,
            reloader: reloader.as_mut(),
            handle: &scheduler_handle,
            host: &mut host,
            scheduled: Vec::new(),
        };
        wiring.schedule::<HeartbeatParams>("heartbeat")?;
        wiring.schedule::<StaleFileCleanupParams>("stale_file_cleanup")?;
        wiring.scheduled
    };
    for name in config.jobs.keys() {
        if !scheduled.contains(name) {
            warn!("No handler for configured job {}, ignoring it", name);
        }
    }

    host.add(Arc::new(AdminServer::new(
        config.metrics_port,
        AdminState {
            scheduler: scheduler_handle,
            runner_state: runner.subscribe_state(),
            queue,
        },
    )));

    if let Some(reloader) = reloader {
        reloader.spawn(root.clone());
    }

    host.run(shutdown_signal()).await
}
