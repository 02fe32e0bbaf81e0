use super::{QueueError, TaskQueue, WorkItem};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Producer-side handle to the task queue, cheap to clone into any part of
/// the application that needs to defer work.
#[derive(Clone)]
pub struct QueueHandle {
    queue: Arc<dyn TaskQueue>,
    /// Bounds how long a producer can be held by a full `Block` queue.
    shutdown: CancellationToken,
}

impl QueueHandle {
    pub fn new(queue: Arc<dyn TaskQueue>, shutdown: CancellationToken) -> Self {
        Self { queue, shutdown }
    }

    /// Defer a plain action. The action receives the token it is expected
    /// to honor cooperatively.
    pub async fn enqueue<F, Fut>(&self, action: F) -> Result<(), QueueError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit(WorkItem::new(action)).await
    }

    /// Defer an action that needs `C` from a scope created at execution time.
    pub async fn enqueue_scoped<C, F, Fut>(&self, action: F) -> Result<(), QueueError>
    where
        C: Send + Sync + 'static,
        F: FnOnce(Arc<C>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit(WorkItem::scoped::<C, F, Fut>(action)).await
    }

    /// Submit a prebuilt item, e.g. one carrying a label.
    pub async fn submit(&self, item: WorkItem) -> Result<(), QueueError> {
        self.queue.enqueue(item, &self.shutdown).await
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }
}
