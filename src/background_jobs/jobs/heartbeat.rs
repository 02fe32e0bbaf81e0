//! Liveness job: logs a message on every trigger.

use crate::background_jobs::{JobConfig, JobContext, JobHandler};
use crate::task_queue::QueueHandle;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

fn default_message() -> String {
    "alive".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeartbeatParams {
    #[serde(default = "default_message")]
    pub message: String,
}

impl Default for HeartbeatParams {
    fn default() -> Self {
        Self {
            message: default_message(),
        }
    }
}

pub struct HeartbeatJob {
    queue: Option<Arc<QueueHandle>>,
}

impl HeartbeatJob {
    pub fn new(queue: Option<Arc<QueueHandle>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler<HeartbeatParams> for HeartbeatJob {
    async fn execute(&self, _ctx: &JobContext, config: &JobConfig<HeartbeatParams>) -> Result<()> {
        match &self.queue {
            Some(queue) => info!(queue_depth = queue.depth(), "{}", config.params.message),
            None => info!("{}", config.params.message),
        }
        Ok(())
    }
}
