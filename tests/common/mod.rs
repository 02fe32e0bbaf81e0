//! Common test infrastructure
//!
//! Fixtures shared by the queue, runner and scheduler integration tests.
//! Tests should only import from this module.

#![allow(dead_code)]

use async_trait::async_trait;
use deferred_worker::background_jobs::{JobConfig, JobContext, JobHandler};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks how many callers are inside a section at once.
#[derive(Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    entered: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(self: &Arc<Self>) -> ProbeGuard {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            probe: Arc::clone(self),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    probe: Arc<ConcurrencyProbe>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Append-only log shared between a test and the work it schedules.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Settings payload of the probe job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbeParams {
    /// How long each execution takes.
    pub work_millis: u64,
    /// Fail every execution with this message.
    #[serde(default)]
    pub fail_with: Option<String>,
    #[serde(default)]
    pub panic: bool,
}

impl ProbeParams {
    pub fn working_for(millis: u64) -> Self {
        Self {
            work_millis: millis,
            fail_with: None,
            panic: false,
        }
    }
}

/// Handler that records its executions in a probe and behaves as its
/// settings ask.
pub struct ProbeHandler {
    pub probe: Arc<ConcurrencyProbe>,
    pub log: EventLog,
}

#[async_trait]
impl JobHandler<ProbeParams> for ProbeHandler {
    async fn execute(
        &self,
        ctx: &JobContext,
        config: &JobConfig<ProbeParams>,
    ) -> anyhow::Result<()> {
        let _guard = self.probe.enter();
        self.log.push(format!("{} {}", config.cron_expression, ctx.correlation_id));

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(config.params.work_millis)) => {}
            _ = ctx.cancellation_token.cancelled() => anyhow::bail!("cancelled"),
        }

        if config.params.panic {
            panic!("probe handler panicked");
        }
        if let Some(message) = &config.params.fail_with {
            anyhow::bail!("{}", message);
        }
        Ok(())
    }
}
