use super::{QueueError, WorkItem};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct State {
    items: VecDeque<WorkItem>,
    completed: bool,
}

/// FIFO storage shared by both queue variants.
///
/// The mutex is only held for synchronous push/pop; waiting happens on the
/// two `Notify`s. Waiters always register interest before inspecting state,
/// so a push between the check and the await cannot be missed.
pub(super) struct Buffer {
    state: Mutex<State>,
    item_ready: Notify,
    space_freed: Notify,
}

impl Buffer {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                completed: false,
            }),
            item_ready: Notify::new(),
            space_freed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(super) fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Append an item. Returns the new depth.
    pub(super) fn push(&self, item: WorkItem) -> Result<usize, QueueError> {
        let depth = {
            let mut state = self.lock();
            if state.completed {
                return Err(QueueError::Closed);
            }
            state.items.push_back(item);
            state.items.len()
        };
        self.item_ready.notify_one();
        Ok(depth)
    }

    /// Append only if fewer than `capacity` items are resident.
    pub(super) fn try_push(&self, item: WorkItem, capacity: usize) -> Result<usize, QueueError> {
        let depth = {
            let mut state = self.lock();
            if state.completed {
                return Err(QueueError::Closed);
            }
            if state.items.len() >= capacity {
                return Err(QueueError::Full { capacity });
            }
            state.items.push_back(item);
            state.items.len()
        };
        self.item_ready.notify_one();
        Ok(depth)
    }

    /// Append, evicting the oldest pending item if the buffer is at capacity.
    /// The evicted item is handed back so the caller drops it outside the lock.
    pub(super) fn push_evicting(
        &self,
        item: WorkItem,
        capacity: usize,
    ) -> Result<(usize, Option<WorkItem>), QueueError> {
        let (depth, evicted) = {
            let mut state = self.lock();
            if state.completed {
                return Err(QueueError::Closed);
            }
            let evicted = if state.items.len() >= capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            (state.items.len(), evicted)
        };
        self.item_ready.notify_one();
        Ok((depth, evicted))
    }

    /// Append, suspending while the buffer is at capacity.
    pub(super) async fn push_waiting(
        &self,
        item: WorkItem,
        capacity: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, QueueError> {
        loop {
            let space = self.space_freed.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.lock();
                if state.completed {
                    return Err(QueueError::Closed);
                }
                if state.items.len() < capacity {
                    state.items.push_back(item);
                    let depth = state.items.len();
                    drop(state);
                    self.item_ready.notify_one();
                    return Ok(depth);
                }
            }

            tokio::select! {
                _ = &mut space => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Take the oldest item, suspending while the buffer is empty.
    ///
    /// `Ok(None)` is end-of-stream: the buffer is completed and fully drained.
    pub(super) async fn pop(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkItem>, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space_freed.notify_one();
                    return Ok(Some(item));
                }
                if state.completed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Mark the buffer completed. Returns false if it already was.
    pub(super) fn complete(&self) -> bool {
        let newly_completed = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.completed, true)
        };
        if newly_completed {
            // Idle consumers must observe end-of-stream, blocked producers
            // must observe the closed queue.
            self.item_ready.notify_waiters();
            self.space_freed.notify_waiters();
        }
        newly_completed
    }
}
