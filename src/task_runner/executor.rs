use crate::server::metrics;
use crate::services::ServiceProvider;
use crate::task_queue::{WorkItem, WorkKind};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How a single work item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Failed,
    Cancelled,
    Panicked,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Success => "success",
            ItemOutcome::Failed => "failed",
            ItemOutcome::Cancelled => "cancelled",
            ItemOutcome::Panicked => "panic",
        }
    }
}

/// Execute one item, containing every failure mode at this boundary.
///
/// Scoped items get a scope created here; it is dropped (disposing its
/// services) before this function returns, whatever the exit path.
pub(crate) async fn execute_work_item(
    worker: usize,
    item: WorkItem,
    services: &Arc<ServiceProvider>,
    token: CancellationToken,
) -> ItemOutcome {
    let id = item.id();
    let label = item.label().map(str::to_owned);
    let start_time = Instant::now();

    let run = async {
        match item.into_kind() {
            WorkKind::Plain(action) => action(token.clone()).await,
            WorkKind::Scoped { capability, action } => {
                let scope = services.create_scope();
                debug!(
                    worker,
                    work_item = %id,
                    capability,
                    scope = %scope.id(),
                    "resolving scoped work item"
                );
                let result = match action(&scope, token.clone()) {
                    Ok(future) => future.await,
                    Err(e) => Err(e),
                };
                drop(scope);
                result
            }
        }
    };

    let result = AssertUnwindSafe(run).catch_unwind().await;
    let elapsed = start_time.elapsed();

    let outcome = match result {
        Ok(Ok(())) => {
            debug!(worker, work_item = %id, label = ?label, ?elapsed, "work item completed");
            ItemOutcome::Success
        }
        Ok(Err(e)) if token.is_cancelled() => {
            info!(
                worker,
                work_item = %id,
                label = ?label,
                error = %e,
                "work item stopped after cancellation"
            );
            ItemOutcome::Cancelled
        }
        Ok(Err(e)) => {
            error!(worker, work_item = %id, label = ?label, ?elapsed, "work item failed: {:#}", e);
            ItemOutcome::Failed
        }
        Err(panic) => {
            error!(
                worker,
                work_item = %id,
                label = ?label,
                "work item panicked: {}",
                panic_message(panic.as_ref())
            );
            ItemOutcome::Panicked
        }
    };

    metrics::record_work_item_execution(outcome.as_str(), elapsed);
    outcome
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
