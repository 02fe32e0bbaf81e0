//! Live reload of `[jobs.<name>]` tables.
//!
//! The reloader polls the config file's modification time. When it changes,
//! the file is parsed again and every watched job whose settings differ gets
//! the new value pushed into its watch channel. Anything that fails to read
//! or parse leaves the previous settings in effect.

use super::FileConfig;
use crate::background_jobs::{JobConfig, JobParams};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

trait SettingsSink: Send + Sync {
    fn job_name(&self) -> &str;

    /// Push the new table if it differs. Returns whether anything changed.
    fn apply(&self, table: &toml::Value) -> Result<bool>;
}

struct JobSettingsSink<P: JobParams> {
    name: String,
    sender: watch::Sender<JobConfig<P>>,
}

impl<P: JobParams> SettingsSink for JobSettingsSink<P> {
    fn job_name(&self) -> &str {
        &self.name
    }

    fn apply(&self, table: &toml::Value) -> Result<bool> {
        let updated = JobConfig::<P>::from_toml(&self.name, table.clone())?;
        Ok(self.sender.send_if_modified(|current| {
            if *current == updated {
                false
            } else {
                *current = updated;
                true
            }
        }))
    }
}

pub struct ConfigReloader {
    path: PathBuf,
    interval: Duration,
    last_modified: Option<SystemTime>,
    sinks: Vec<Box<dyn SettingsSink>>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            interval,
            last_modified,
            sinks: Vec::new(),
        }
    }

    /// Start tracking job `name`. The returned receiver is the job's live
    /// settings source, seeded with `initial`.
    pub fn watch_job<P: JobParams>(
        &mut self,
        name: &str,
        initial: JobConfig<P>,
    ) -> watch::Receiver<JobConfig<P>> {
        let (sender, receiver) = watch::channel(initial);
        self.sinks.push(Box::new(JobSettingsSink {
            name: name.to_string(),
            sender,
        }));
        receiver
    }

    pub fn watched_jobs(&self) -> usize {
        self.sinks.len()
    }

    /// Reload if the file's modification time changed since the last look.
    /// Returns the number of jobs whose settings changed.
    pub fn check(&mut self) -> usize {
        let modified = modified_time(&self.path);
        if modified == self.last_modified {
            return 0;
        }
        self.last_modified = modified;
        debug!("Config file {:?} changed on disk", self.path);

        match self.reload_now() {
            Ok(changed) => changed,
            Err(e) => {
                error!("Config reload failed, keeping previous settings: {:#}", e);
                0
            }
        }
    }

    /// Re-read the file and push every changed job table.
    pub fn reload_now(&self) -> Result<usize> {
        let file = FileConfig::load(&self.path)?;
        let mut changed = 0;

        for sink in &self.sinks {
            let Some(table) = file.jobs.get(sink.job_name()) else {
                warn!(
                    "Job {} is missing from the reloaded config, keeping previous settings",
                    sink.job_name()
                );
                continue;
            };
            match sink.apply(table) {
                Ok(true) => {
                    info!("Reloaded settings of job {}", sink.job_name());
                    changed += 1;
                }
                Ok(false) => {}
                Err(e) => error!(
                    "Invalid reloaded settings for job {}, keeping previous: {:#}",
                    sink.job_name(),
                    e
                ),
            }
        }

        Ok(changed)
    }

    /// Poll until `shutdown` fires. Each check runs on the blocking pool
    /// since it stats and reads the file.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Watching {:?} for changes every {:?} ({} job(s))",
                self.path,
                self.interval,
                self.sinks.len()
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut reloader = self;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let checked = tokio::task::spawn_blocking(move || {
                    reloader.check();
                    reloader
                })
                .await;
                reloader = match checked {
                    Ok(reloader) => reloader,
                    Err(e) => {
                        error!("Config reload task failed, stopping the reloader: {}", e);
                        break;
                    }
                };
            }
            debug!("Config reloader stopped");
        })
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
