use super::buffer::Buffer;
use super::{QueueError, TaskQueue, WorkItem};
use crate::server::metrics;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;
use std::num::NonZeroUsize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const QUEUE_KIND: &str = "bounded";

/// What `enqueue` does when a bounded queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FullQueuePolicy {
    /// Suspend the producer until space frees up or its token is cancelled.
    #[default]
    Block,
    /// Fail immediately with `QueueError::Full`.
    Reject,
    /// Discard the oldest pending item to make room. Never fails on capacity.
    DropOldest,
}

impl std::fmt::Display for FullQueuePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FullQueuePolicy::Block => write!(f, "block"),
            FullQueuePolicy::Reject => write!(f, "reject"),
            FullQueuePolicy::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

/// Fixed-capacity queue. Resident items never exceed `capacity`.
pub struct BoundedTaskQueue {
    buffer: Buffer,
    capacity: NonZeroUsize,
    policy: FullQueuePolicy,
}

impl BoundedTaskQueue {
    pub fn new(capacity: NonZeroUsize, policy: FullQueuePolicy) -> Self {
        Self {
            buffer: Buffer::new(),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn policy(&self) -> FullQueuePolicy {
        self.policy
    }
}

#[async_trait]
impl TaskQueue for BoundedTaskQueue {
    fn kind(&self) -> &'static str {
        QUEUE_KIND
    }

    async fn enqueue(&self, item: WorkItem, cancel: &CancellationToken) -> Result<(), QueueError> {
        let id = item.id();
        let capacity = self.capacity.get();

        let depth = match self.policy {
            FullQueuePolicy::Block => self.buffer.push_waiting(item, capacity, cancel).await?,
            FullQueuePolicy::Reject => match self.buffer.try_push(item, capacity) {
                Ok(depth) => depth,
                Err(e) => {
                    if matches!(e, QueueError::Full { .. }) {
                        warn!(work_item = %id, capacity, "task queue full, rejecting work item");
                        metrics::record_work_item_rejected(QUEUE_KIND);
                    }
                    return Err(e);
                }
            },
            FullQueuePolicy::DropOldest => {
                let (depth, evicted) = self.buffer.push_evicting(item, capacity)?;
                if let Some(evicted) = evicted {
                    debug!(
                        evicted = %evicted,
                        work_item = %id,
                        "task queue full, evicted oldest work item"
                    );
                    metrics::record_work_item_evicted(QUEUE_KIND);
                }
                depth
            }
        };

        debug!(work_item = %id, depth, policy = %self.policy, "enqueued work item");
        metrics::record_work_item_enqueued(QUEUE_KIND);
        metrics::set_task_queue_depth(QUEUE_KIND, depth);
        Ok(())
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

    fn queue(capacity: usize, policy: FullQueuePolicy) -> Arc<BoundedTaskQueue> {
        Arc::new(BoundedTaskQueue::new(
            NonZeroUsize::new(capacity).unwrap(),
            policy,
        ))
    }

    fn labeled(i: usize) -> WorkItem {
        WorkItem::new(|_| async { Ok(()) }).with_label(format!("item-{i}"))
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let queue = queue(2, FullQueuePolicy::Reject);
        let token = CancellationToken::new();

        queue.enqueue(labeled(0), &token).await.unwrap();
        queue.enqueue(labeled(1), &token).await.unwrap();
        let err = queue.enqueue(labeled(2), &token).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 2 }));
        assert_eq!(queue.len(), 2);

        queue.dequeue(&token).await.unwrap();
        queue.enqueue(labeled(3), &token).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let queue = queue(3, FullQueuePolicy::DropOldest);
        let token = CancellationToken::new();

        for i in 0..5 {
            queue.enqueue(labeled(i), &token).await.unwrap();
            assert!(queue.len() <= 3);
        }

        let mut labels = Vec::new();
        queue.complete();
        while let Some(item) = queue.dequeue(&token).await.unwrap() {
            labels.push(item.label().unwrap().to_string());
        }
        assert_eq!(labels, vec!["item-2", "item-3", "item-4"]);
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let queue = queue(1, FullQueuePolicy::Block);
        let token = CancellationToken::new();
        queue.enqueue(labeled(0), &token).await.unwrap();

        let producer = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.enqueue(labeled(1), &token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        let first = queue.dequeue(&token).await.unwrap().unwrap();
        assert_eq!(first.label(), Some("item-0"));

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume once space frees")
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_block_honors_cancellation() {
        let queue = queue(1, FullQueuePolicy::Block);
        let token = CancellationToken::new();
        queue.enqueue(labeled(0), &token).await.unwrap();

        let producer_token = CancellationToken::new();
        let producer = {
            let queue = queue.clone();
            let producer_token = producer_token.clone();
            tokio::spawn(async move { queue.enqueue(labeled(1), &producer_token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        producer_token.cancel();
        let result = producer.await.unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_releases_blocked_producer() {
        let queue = queue(1, FullQueuePolicy::Block);
        let token = CancellationToken::new();
        queue.enqueue(labeled(0), &token).await.unwrap();

        let producer = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.enqueue(labeled(1), &token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete();
        let result = producer.await.unwrap();
        assert!(matches!(result, Err(QueueError::Closed)));
    }
}
