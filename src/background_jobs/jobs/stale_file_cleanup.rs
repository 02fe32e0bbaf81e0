//! Stale file cleanup background job.
//!
//! Scans a directory for files whose modification time is older than the
//! retention period and defers the deletion of each one to the task queue.

use crate::background_jobs::{JobConfig, JobContext, JobHandler};
use crate::task_queue::{QueueHandle, WorkItem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

fn default_retention_days() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaleFileCleanupParams {
    pub directory: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

/// Defers deletion of files older than `retention_days` under `directory`.
pub struct StaleFileCleanupJob {
    queue: Arc<QueueHandle>,
}

impl StaleFileCleanupJob {
    pub fn new(queue: Arc<QueueHandle>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler<StaleFileCleanupParams> for StaleFileCleanupJob {
    async fn execute(
        &self,
        ctx: &JobContext,
        config: &JobConfig<StaleFileCleanupParams>,
    ) -> Result<()> {
        let params = &config.params;
        if !params.directory.exists() {
            debug!("Cleanup directory does not exist: {:?}", params.directory);
            return Ok(());
        }

        let retention = Duration::from_secs(params.retention_days.saturating_mul(24 * 60 * 60));
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let directory = params.directory.clone();
        let cancel = ctx.cancellation_token.clone();
        let stale =
            tokio::task::spawn_blocking(move || find_stale_files(&directory, cutoff, &cancel))
                .await
            .context("stale file scan did not complete")?;

        info!(
            "Found {} file(s) older than {} days in {:?}",
            stale.len(),
            params.retention_days,
            params.directory
        );

        let mut queued = 0usize;
        for path in stale {
            if ctx.is_cancelled() {
                anyhow::bail!("cancelled after queueing {} deletion(s)", queued);
            }
            let label = format!("delete {}", path.display());
            let item = WorkItem::new(move |_: CancellationToken| async move {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to delete {:?}", path))
            })
            .with_label(label);
            self.queue
                .submit(item)
                .await
                .context("Failed to queue file deletion")?;
            queued += 1;
        }

        if queued > 0 {
            info!("Queued {} file deletion(s)", queued);
        }
        Ok(())
    }
}

/// Files under `root` last modified before `cutoff`. Unreadable entries are
/// logged and skipped.
fn find_stale_files(root: &Path, cutoff: SystemTime, cancel: &CancellationToken) -> Vec<PathBuf> {
    let mut stale = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        if cancel.is_cancelled() {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(modified) if modified <= cutoff => stale.push(entry.into_path()),
            Some(_) => {}
            None => warn!("Could not read modification time of {:?}", entry.path()),
        }
    }
    stale
}
