//! Task Queue (C8): a bounded priority FIFO with 4 priority bands, per
//! spec §3/§4.2.
//!
//! Ordering key is `(band, seq)`: bands sort ascending (0=critical first),
//! and within a band FIFO order is preserved via a monotonic sequence
//! number. `BTreeMap` gives O(log n) submit/pop/remove, satisfying the
//! cancellation complexity bound in spec §4.2.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::task::{Task, PRIORITY_BANDS};
use crate::error::RuntimeError;

type QueueKey = (u8, i64);

struct Inner {
    tasks: BTreeMap<QueueKey, Task>,
    index: std::collections::HashMap<String, QueueKey>,
}

/// A bounded multi-producer multi-consumer priority queue of `Task`s.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    capacity_per_band: usize,
    next_seq: AtomicI64,
    next_requeue_seq: AtomicI64,
    /// Signaled whenever a task is submitted or requeued, so the
    /// Coordinator's dispatch loop can wake from its bounded sleep early
    /// (spec §4.2 step 2: "sleep until either a completion event fires, or
    /// a bounded 50ms wakeup").
    pub notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(capacity_per_band: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: BTreeMap::new(),
                index: std::collections::HashMap::new(),
            }),
            capacity_per_band,
            next_seq: AtomicI64::new(0),
            next_requeue_seq: AtomicI64::new(i64::MIN),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Submit a task at the tail of its priority band. Fails with
    /// `QUEUE_FULL` if the band is at capacity; the existing queue is left
    /// untouched (spec §8 boundary behavior).
    pub async fn submit(&self, task: Task) -> Result<(), RuntimeError> {
        let band = task.priority;
        let mut inner = self.inner.lock().await;

        let depth = inner
            .tasks
            .keys()
            .filter(|(b, _)| *b == band)
            .count();
        if depth >= self.capacity_per_band {
            return Err(RuntimeError::QueueFull { band });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = (band, seq);
        inner.index.insert(task.id.clone(), key);
        inner.tasks.insert(key, task);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Put a previously-popped task back at the head of its band (spec
    /// §4.2 step 2), ahead of every normally-submitted task in that band
    /// but behind any task already re-queued earlier.
    pub async fn requeue_at_head(&self, task: Task) {
        let band = task.priority;
        let seq = self.next_requeue_seq.fetch_add(1, Ordering::Relaxed);
        let key = (band, seq);
        let mut inner = self.inner.lock().await;
        inner.index.insert(task.id.clone(), key);
        inner.tasks.insert(key, task);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Pop the highest-priority, earliest-queued task, if any.
    pub async fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let key = *inner.tasks.keys().next()?;
        let task = inner.tasks.remove(&key)?;
        inner.index.remove(&task.id);
        Some(task)
    }

    /// Remove a specific queued task by id, e.g. for cancellation while
    /// still QUEUED (spec §4.2: "removed in O(log n)").
    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let key = inner.index.remove(task_id)?;
        inner.tasks.remove(&key)
    }

    /// Queue depth per priority band, for the `queue_depth{priority}` gauge.
    pub async fn depth_by_band(&self) -> [usize; PRIORITY_BANDS as usize] {
        let inner = self.inner.lock().await;
        let mut depths = [0usize; PRIORITY_BANDS as usize];
        for (band, _) in inner.tasks.keys() {
            depths[*band as usize] += 1;
        }
        depths
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::task::TaskPayload;

    fn chat_task(priority: u8) -> Task {
        Task::new("chat", priority, TaskPayload::Chat { input: "hi".into() })
    }

    #[tokio::test]
    async fn pops_in_priority_then_fifo_order() {
        let queue = TaskQueue::new(16);
        let t1 = chat_task(3);
        let t2 = chat_task(0);
        let t3 = chat_task(3);
        let (id1, id2, id3) = (t1.id.clone(), t2.id.clone(), t3.id.clone());

        queue.submit(t1).await.unwrap();
        queue.submit(t2).await.unwrap();
        queue.submit(t3).await.unwrap();

        assert_eq!(queue.pop().await.unwrap().id, id2);
        assert_eq!(queue.pop().await.unwrap().id, id1);
        assert_eq!(queue.pop().await.unwrap().id, id3);
    }

    #[tokio::test]
    async fn full_band_rejects_without_disturbing_queue() {
        let queue = TaskQueue::new(1);
        queue.submit(chat_task(1)).await.unwrap();
        let err = queue.submit(chat_task(1)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::QueueFull { band: 1 }));
        assert_eq!(queue.depth_by_band().await[1], 1);
    }

    #[tokio::test]
    async fn requeue_goes_to_head_of_band() {
        let queue = TaskQueue::new(16);
        let t1 = chat_task(1);
        let t2 = chat_task(1);
        let id1 = t1.id.clone();
        let id2 = t2.id.clone();

        queue.submit(t1.clone()).await.unwrap();
        queue.submit(t2).await.unwrap();

        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.id, id1);
        queue.requeue_at_head(popped).await;

        // t1 is back at the head of band 1, ahead of t2.
        assert_eq!(queue.pop().await.unwrap().id, id1);
        assert_eq!(queue.pop().await.unwrap().id, id2);
    }

    #[tokio::test]
    async fn cancel_removes_queued_task() {
        let queue = TaskQueue::new(16);
        let t1 = chat_task(2);
        let id = t1.id.clone();
        queue.submit(t1).await.unwrap();

        let removed = queue.remove(&id).await;
        assert!(removed.is_some());
        assert!(queue.is_empty().await);
    }
}
