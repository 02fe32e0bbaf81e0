//! In-memory work queue feeding the task runner.
//!
//! Two interchangeable implementations of [`TaskQueue`] are provided:
//! [`UnboundedTaskQueue`], where producers never wait, and
//! [`BoundedTaskQueue`], whose behavior at capacity is chosen with a
//! [`FullQueuePolicy`]. Delivery is best-effort and in-process only.

mod bounded;
mod buffer;
mod handle;
mod unbounded;
mod work_item;

pub use bounded::{BoundedTaskQueue, FullQueuePolicy};
pub use handle::QueueHandle;
pub use unbounded::UnboundedTaskQueue;
pub use work_item::{WorkFuture, WorkItem, WorkKind};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced to queue callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue has been completed and accepts no more work")]
    Closed,

    #[error("task queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("operation cancelled")]
    Cancelled,
}

/// Thread-safe FIFO of work items with an explicit completion signal.
///
/// Callers never lock around these methods; synchronization is internal.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Short name of the implementation, used as a metrics label.
    fn kind(&self) -> &'static str;

    /// Hand an item to exactly one future consumer.
    ///
    /// Fails with `Closed` once `complete` has been called. Only a bounded
    /// queue with the `Block` policy ever suspends here; `cancel` bounds that
    /// wait.
    async fn enqueue(&self, item: WorkItem, cancel: &CancellationToken) -> Result<(), QueueError>;

    /// Wait for the next item.
    ///
    /// Returns `Ok(None)` once the queue is completed and drained, and
    /// `Err(Cancelled)` when `cancel` fires first. Cancelling never loses
    /// items that are already queued.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<WorkItem>, QueueError>;

    /// Stop accepting items. Idempotent. Pending items are still delivered.
    fn complete(&self);

    fn is_completed(&self) -> bool;

    /// Number of items currently resident.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stream every item the queue delivers until end-of-stream or cancellation.
///
/// Each call yields a fresh stream; it is finite once the queue is completed
/// and unbounded otherwise.
pub fn read_all(
    queue: Arc<dyn TaskQueue>,
    cancel: CancellationToken,
) -> BoxStream<'static, WorkItem> {
    stream::unfold((queue, cancel), |(queue, cancel)| async move {
        match queue.dequeue(&cancel).await {
            Ok(Some(item)) => Some((item, (queue, cancel))),
            Ok(None) | Err(_) => None,
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    #[tokio::test]
    async fn test_read_all_ends_after_complete() {
        let queue: Arc<dyn TaskQueue> = Arc::new(UnboundedTaskQueue::new());
        let token = CancellationToken::new();
        for i in 0..3 {
            queue
                .enqueue(
                    WorkItem::new(|_| async { Ok(()) }).with_label(i.to_string()),
                    &token,
                )
                .await
                .unwrap();
        }
        queue.complete();

        let labels: Vec<String> = read_all(queue.clone(), token)
            .map(|item| item.label().unwrap_or_default().to_string())
            .collect()
            .await;
        assert_eq!(labels, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_read_all_stops_on_cancel() {
        let queue: Arc<dyn TaskQueue> = Arc::new(BoundedTaskQueue::new(
            NonZeroUsize::new(4).unwrap(),
            FullQueuePolicy::Reject,
        ));
        let token = CancellationToken::new();
        let mut items = read_all(queue.clone(), token.clone());

        queue
            .enqueue(WorkItem::new(|_| async { Ok(()) }), &token)
            .await
            .unwrap();
        assert!(items.next().await.is_some());

        token.cancel();
        assert!(items.next().await.is_none());
        assert!(!queue.is_completed());
    }
}
