use crate::task_queue::FullQueuePolicy;
use crate::task_runner::ShutdownBehavior;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub metrics_port: Option<u16>,
    pub config_reload_interval_secs: Option<u64>,

    pub task_queue: Option<TaskQueueConfig>,
    pub task_runner: Option<TaskRunnerConfig>,

    /// One table per scheduled job, keyed by job name. Each table is
    /// deserialized later into the job's typed settings.
    pub jobs: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Unbounded,
    Bounded,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TaskQueueConfig {
    pub kind: Option<QueueKind>,
    pub capacity: Option<usize>,
    pub full_policy: Option<FullQueuePolicy>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TaskRunnerConfig {
    pub workers: Option<usize>,
    pub shutdown_timeout_secs: Option<u64>,
    pub shutdown_behavior: Option<ShutdownBehavior>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
