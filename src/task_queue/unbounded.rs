use super::buffer::Buffer;
use super::{QueueError, TaskQueue, WorkItem};
use crate::server::metrics;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const QUEUE_KIND: &str = "unbounded";

/// Queue that grows without limit. Producers never wait.
pub struct UnboundedTaskQueue {
    buffer: Buffer,
}

impl UnboundedTaskQueue {
    pub fn new() -> Self {
        Self {
            buffer: Buffer::new(),
        }
    }

    /// Enqueue without an async context. Never blocks.
    pub fn push(&self, item: WorkItem) -> Result<(), QueueError> {
        let id = item.id();
        let depth = self.buffer.push(item)?;
        debug!(work_item = %id, depth, "enqueued work item");
        metrics::record_work_item_enqueued(QUEUE_KIND);
        metrics::set_task_queue_depth(QUEUE_KIND, depth);
        Ok(())
    }
}

impl Default for UnboundedTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for UnboundedTaskQueue {
    fn kind(&self) -> &'static str {
        QUEUE_KIND
    }

    async fn enqueue(&self, item: WorkItem, _cancel: &CancellationToken) -> Result<(), QueueError> {
        self.push(item)
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<WorkItem>, QueueError> {
        let item = self.buffer.pop(cancel).await?;
        metrics::set_task_queue_depth(QUEUE_KIND, self.buffer.len());
        Ok(item)
    }

    fn complete(&self) {
        if self.buffer.complete() {
            debug!(queue = QUEUE_KIND, "task queue completed");
        }
    }

    fn is_completed(&self) -> bool {
        self.buffer.is_completed()
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn noop() -> WorkItem {
        WorkItem::new(|_| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = UnboundedTaskQueue::new();
        let token = CancellationToken::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let item = noop();
            ids.push(item.id());
            queue.push(item).unwrap();
        }

        for id in ids {
            let item = queue.dequeue(&token).await.unwrap().unwrap();
            assert_eq!(item.id(), id);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_complete_fails() {
        let queue = UnboundedTaskQueue::new();
        queue.complete();
        queue.complete();
        assert!(queue.is_completed());
        assert!(matches!(queue.push(noop()), Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_item() {
        let queue = Arc::new(UnboundedTaskQueue::new());
        let token = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        queue.push(noop().with_label("late")).unwrap();
        let item = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(item.label(), Some("late"));
    }

    #[tokio::test]
    async fn test_cancelled_dequeue_keeps_items() {
        let queue = UnboundedTaskQueue::new();
        let token = CancellationToken::new();
        token.cancel();

        queue.push(noop()).unwrap();
        assert!(matches!(
            queue.dequeue(&token).await,
            Err(QueueError::Cancelled)
        ));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_wakes_idle_consumer() {
        let queue = Arc::new(UnboundedTaskQueue::new());
        let token = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake on completion")
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }
}
