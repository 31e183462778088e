//! Agent Coordinator (C9): dispatch loop matching queued tasks to eligible
//! agents, per spec §4.2.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use super::queue::TaskQueue;
use super::task::{Task, TaskResult, TaskStatus};
use super::{AgentEntry, AgentPool, TaskContext};
use crate::backend::router::ModelRouter;
use crate::error::RuntimeError;
use crate::metrics::{names, MetricsSink};
use crate::storage::ResultStore;

/// Bounded wakeup for the dispatch loop when no eligible agent was found
/// for the head-of-queue task (spec §4.2 step 2).
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle events the Coordinator emits as tasks move through the
/// pipeline, consumed by the Session Hub to push progress to clients
/// (spec §4.2, §6.1).
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Dispatched { task_id: String, agent_id: String },
    Completed { result: TaskResult },
}

/// Coordinates dispatch of queued tasks onto the Agent Pool.
pub struct AgentCoordinator {
    queue: Arc<TaskQueue>,
    pool: Arc<AgentPool>,
    router: Arc<ModelRouter>,
    store: Arc<dyn ResultStore>,
    metrics: Arc<dyn MetricsSink>,
    events: broadcast::Sender<TaskEvent>,
    cancellations: Arc<dashmap::DashMap<String, watch::Sender<bool>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl AgentCoordinator {
    pub fn new(
        queue: Arc<TaskQueue>,
        pool: Arc<AgentPool>,
        router: Arc<ModelRouter>,
        store: Arc<dyn ResultStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            queue,
            pool,
            router,
            store,
            metrics,
            events,
            cancellations: Arc::new(dashmap::DashMap::new()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Submit a task for dispatch. Rejects immediately if its deadline has
    /// already passed (spec §8 boundary behavior), without ever touching
    /// the queue.
    pub async fn submit(&self, task: Task) -> Result<(), RuntimeError> {
        if task.deadline_already_passed() {
            let result = TaskResult::failure(task.id.clone(), "DEADLINE_EXCEEDED", Utc::now());
            self.store.put_task_result(result.clone()).await;
            let _ = self.events.send(TaskEvent::Completed { result });
            return Ok(());
        }
        let labels = crate::labels! { "kind" => task.kind.clone() };
        self.metrics.incr_counter(names::TASKS_SUBMITTED_TOTAL, &labels, 1);
        self.queue.submit(task).await
    }

    /// Cancel a task. No-op if it's already terminal or unknown.
    pub async fn cancel(&self, task_id: &str) {
        if let Some((_, sender)) = self.cancellations.remove(task_id) {
            let _ = sender.send(true);
            return;
        }
        if let Some(mut task) = self.queue.remove(task_id).await {
            task.status = TaskStatus::Cancelled;
            let result = TaskResult::failure(task.id.clone(), "CANCELLED", task.created_at);
            self.store.put_task_result(result.clone()).await;
            let _ = self.events.send(TaskEvent::Completed { result });
        }
    }

    /// Run the dispatch loop until `shutdown()` is called. Intended to be
    /// spawned as its own long-lived task (spec §5 concurrency model: one
    /// coordinator task per runtime instance).
    pub async fn run(self: Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(tx);

        loop {
            if *rx.borrow() {
                info!("coordinator shutting down");
                return;
            }

            let Some(task) = self.queue.pop().await else {
                tokio::select! {
                    _ = self.queue.notify.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL_INTERVAL) => {}
                    _ = rx.changed() => {}
                }
                continue;
            };

            let capability = task.required_capability();
            let eligible = self.pool.eligible_for(capability).await;

            let Some(agent) = eligible.into_iter().find(|a| match &task.agent_target {
                super::task::AgentTarget::Any => true,
                super::task::AgentTarget::Specific(id) => &a.spec.id == id,
            }) else {
                self.queue.requeue_at_head(task).await;
                tokio::select! {
                    _ = self.queue.notify.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL_INTERVAL) => {}
                    _ = rx.changed() => {}
                }
                continue;
            };

            if !self.pool.try_reserve(&agent).await {
                self.queue.requeue_at_head(task).await;
                continue;
            }

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.run_task(task, agent).await;
            });
        }
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().await.as_ref() {
            let _ = tx.send(true);
        }
    }

    async fn run_task(&self, task: Task, agent: Arc<AgentEntry>) {
        let started_at = Utc::now();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancellations.insert(task.id.clone(), cancel_tx);

        let _ = self.events.send(TaskEvent::Dispatched {
            task_id: task.id.clone(),
            agent_id: agent.spec.id.clone(),
        });

        let ctx = TaskContext::new(task.id.clone(), task.deadline, cancel_rx);
        let handler = Arc::clone(&agent.handler);
        let router = Arc::clone(&self.router);
        let task_for_handler = task.clone();

        let outcome = tokio::task::spawn(async move { handler.handle(&task_for_handler, &ctx, &router).await })
            .await;

        self.cancellations.remove(&task.id);
        let latency = (Utc::now() - started_at).to_std().unwrap_or_default();

        let result = match outcome {
            Ok(Ok(output)) => {
                self.pool.release(&agent, true, latency).await;
                TaskResult::success(
                    task.id.clone(),
                    agent.spec.id.clone(),
                    output.content,
                    output.tokens_in,
                    output.tokens_out,
                    output.cost,
                    output.backend_id,
                    started_at,
                    output.stop,
                )
            }
            Ok(Err(err)) => {
                self.pool.release(&agent, false, latency).await;
                warn!(task_id = %task.id, error = %err, "task handler returned an error");
                TaskResult::failure(task.id.clone(), err.to_string(), started_at)
            }
            Err(join_err) => {
                self.pool.release(&agent, false, latency).await;
                error!(task_id = %task.id, error = %join_err, "task handler panicked");
                TaskResult::failure(task.id.clone(), "INTERNAL", started_at)
            }
        };

        let labels = crate::labels! { "agent" => agent.spec.id.clone() };
        self.metrics.incr_counter(names::TASKS_COMPLETED_TOTAL, &labels, 1);
        self.metrics
            .observe_histogram(names::TASK_LATENCY_MS, &labels, latency.as_millis() as f64);

        self.store.put_task_result(result.clone()).await;
        let _ = self.events.send(TaskEvent::Completed { result });
    }
}
