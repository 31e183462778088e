//! Result Store: retains terminal Task/Collaboration results for retrieval
//! after completion, per spec §3 ("Lifecycle") and §6.3.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::agent::task::TaskResult;
use crate::collaboration::CollabResult;

/// External result persistence contract (spec §6.3). The in-memory bounded
/// LRU below is the reference implementation; a durable store is an
/// embedding-application concern.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put_task_result(&self, result: TaskResult);
    async fn get_task_result(&self, task_id: &str) -> Option<TaskResult>;
    async fn put_collab_result(&self, result: CollabResult);
    async fn get_collab_result(&self, collab_id: &str) -> Option<CollabResult>;
}

struct Entry<T> {
    key: String,
    value: T,
    inserted_at: Instant,
}

/// A bounded, TTL-expiring store for one result kind. Eviction is oldest-
/// first once `capacity` is exceeded; `ttl` additionally hides (and lazily
/// removes) entries older than the retention window (spec default: 5
/// minutes).
struct Bounded<T: Clone> {
    entries: VecDeque<Entry<T>>,
    capacity: usize,
    ttl: Duration,
}

impl<T: Clone> Bounded<T> {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    fn put(&mut self, key: String, value: T) {
        self.entries.retain(|e| e.key != key);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry {
            key,
            value,
            inserted_at: Instant::now(),
        });
    }

    fn get(&mut self, key: &str) -> Option<T> {
        self.entries.retain(|e| e.inserted_at.elapsed() < self.ttl);
        self.entries.iter().find(|e| e.key == key).map(|e| e.value.clone())
    }
}

/// Default retention window: results are retrievable for at least 5
/// minutes after completion (spec §3).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Default bounded capacity per result kind.
pub const DEFAULT_CAPACITY: usize = 4096;

/// In-memory bounded LRU, the reference `ResultStore` (spec §6.3).
pub struct InMemoryResultStore {
    tasks: Mutex<Bounded<TaskResult>>,
    collabs: Mutex<Bounded<CollabResult>>,
}

impl InMemoryResultStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(Bounded::new(capacity, DEFAULT_RETENTION)),
            collabs: Mutex::new(Bounded::new(capacity, DEFAULT_RETENTION)),
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put_task_result(&self, result: TaskResult) {
        self.tasks.lock().await.put(result.task_id.clone(), result);
    }

    async fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.tasks.lock().await.get(task_id)
    }

    async fn put_collab_result(&self, result: CollabResult) {
        self.collabs.lock().await.put(result.collab_id.clone(), result);
    }

    async fn get_collab_result(&self, collab_id: &str) -> Option<CollabResult> {
        self.collabs.lock().await.get(collab_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::task::TaskStatus;
    use chrono::Utc;

    fn task_result(id: &str) -> TaskResult {
        TaskResult::success(id, "agent-a", "done".into(), 1, 1, 0.0, "backend-a", Utc::now(), false)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = InMemoryResultStore::new(4);
        store.put_task_result(task_result("t1")).await;
        let got = store.get_task_result("t1").await.unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let store = InMemoryResultStore::new(2);
        store.put_task_result(task_result("t1")).await;
        store.put_task_result(task_result("t2")).await;
        store.put_task_result(task_result("t3")).await;
        assert!(store.get_task_result("t1").await.is_none());
        assert!(store.get_task_result("t3").await.is_some());
    }

    #[tokio::test]
    async fn expires_beyond_ttl() {
        let mut bounded: Bounded<TaskResult> = Bounded::new(10, Duration::from_millis(5));
        bounded.put("t1".to_string(), task_result("t1"));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(bounded.get("t1").is_none());
    }
}
