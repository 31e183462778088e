//! Agent Pool (C7): a fixed catalog of typed agents, each bound to a
//! capability set and a preferred backend tier, per spec §3/§4.2.

pub mod coordinator;
pub mod queue;
pub mod task;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::backend::router::ModelRouter;
use crate::error::RuntimeError;
use task::Task;

/// Static declaration of an agent, as it would arrive via `RuntimeConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub preferred_backend_capability: String,
    pub system_preamble: String,
    /// This agent's expertise weight, consulted by the `EXPERTISE_WEIGHTED`
    /// collaboration resolution policy (spec §4.3). Agents with no stated
    /// specialization default to `1.0`, the same weight a plain vote carries.
    pub expertise_weight: f64,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            capabilities,
            max_concurrent_tasks: 3,
            preferred_backend_capability: "chat".to_string(),
            system_preamble: String::new(),
            expertise_weight: 1.0,
        }
    }
}

/// Runtime lifecycle state of an Agent (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Idle,
    Busy,
    Paused,
    Error,
}

/// What an agent's handler produces for a single task; the Coordinator
/// turns this into a `TaskResult`.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub content: String,
    pub reasoning: Option<Vec<String>>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub backend_id: String,
    /// Set by a handler participating in a `CASCADE` collaboration to end
    /// it early, its own output becoming terminal (spec §4.3). Ignored by
    /// every other strategy.
    pub stop: bool,
}

/// Cancellation-aware context handed to an agent handler for a single task,
/// per spec §9 ("coroutines / callbacks" re-architecture note: handlers are
/// request/response computations with a cancellation-aware context, not
/// callback registrations).
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub deadline: Option<DateTime<Utc>>,
    cancelled: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(task_id: String, deadline: Option<DateTime<Utc>>, cancelled: watch::Receiver<bool>) -> Self {
        Self {
            task_id,
            deadline,
            cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Utc::now() >= d).unwrap_or(false)
    }

    /// Checked at every I/O boundary per spec §5. Returns the terminating
    /// error if the task should stop now.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if self.is_expired() {
            return Err(RuntimeError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// The single contract every agent implements (spec §9: "agents are not
/// subclasses; they are values implementing a single `Agent` contract").
/// Specializations (frontend/backend/devops/qa/...) are data carried in
/// `AgentSpec`, not distinct types.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle(
        &self,
        task: &Task,
        ctx: &TaskContext,
        router: &ModelRouter,
    ) -> Result<AgentOutput, RuntimeError>;
}

/// Per-agent metrics, exposed read-only (spec §4.2).
#[derive(Debug)]
pub struct AgentMetrics {
    completed_count: AtomicU64,
    failed_count: AtomicU64,
    total_latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    last_activity_at: AtomicI64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            completed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_activity_at: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

/// Read-only snapshot of `AgentMetrics`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentMetricsSnapshot {
    pub completed_count: u64,
    pub failed_count: u64,
    pub total_latency_ms: u64,
    pub in_flight: usize,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentMetrics {
    fn snapshot(&self) -> AgentMetricsSnapshot {
        AgentMetricsSnapshot {
            completed_count: self.completed_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            last_activity_at: DateTime::from_timestamp_millis(
                self.last_activity_at.load(Ordering::Relaxed),
            )
            .unwrap_or_else(Utc::now),
        }
    }

    fn touch(&self) {
        self.last_activity_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// One entry in the Agent Pool: the static spec, the handler implementation,
/// and the mutable runtime state the Coordinator owns exclusively.
pub struct AgentEntry {
    pub spec: AgentSpec,
    pub handler: Arc<dyn Agent>,
    pub state: RwLock<AgentState>,
    pub metrics: AgentMetrics,
    // Cached alongside `spec.capabilities` (a Vec, kept for deterministic
    // (de)serialization order) for O(1) membership checks.
    capability_set: HashSet<String>,
}

impl AgentEntry {
    pub fn capabilities(&self) -> &HashSet<String> {
        &self.capability_set
    }

    fn new(spec: AgentSpec, handler: Arc<dyn Agent>) -> Self {
        let capability_set = spec.capabilities.iter().cloned().collect();
        Self {
            spec,
            handler,
            state: RwLock::new(AgentState::Idle),
            metrics: AgentMetrics::default(),
            capability_set,
        }
    }
}

/// Fixed catalog of agents (spec §2, C7). Agents are registered at startup;
/// the Agent Pool exclusively owns them thereafter (spec §3 ownership
/// summary).
pub struct AgentPool {
    agents: DashMap<String, Arc<AgentEntry>>,
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentPool {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    pub fn register(&self, spec: AgentSpec, handler: Arc<dyn Agent>) {
        let id = spec.id.clone();
        self.agents.insert(id, Arc::new(AgentEntry::new(spec, handler)));
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.get(agent_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// All agents declaring `capability`, whose state is neither `Paused`
    /// nor `Error` (spec §3 invariant: such agents are skipped), sorted by
    /// current load ascending so the least-busy eligible agent is tried
    /// first.
    pub async fn eligible_for(&self, capability: &str) -> Vec<Arc<AgentEntry>> {
        let mut eligible = Vec::new();
        for entry in self.agents.iter() {
            let agent = entry.value().clone();
            if !agent.capability_set.contains(capability) {
                continue;
            }
            let state = *agent.state.read().await;
            if matches!(state, AgentState::Paused | AgentState::Error) {
                continue;
            }
            if agent.metrics.in_flight.load(Ordering::Relaxed) >= agent.spec.max_concurrent_tasks {
                continue;
            }
            eligible.push(agent);
        }
        eligible.sort_by_key(|a| a.metrics.in_flight.load(Ordering::Relaxed));
        eligible
    }

    pub async fn metrics_snapshot(&self, agent_id: &str) -> Option<AgentMetricsSnapshot> {
        self.get(agent_id).map(|a| a.metrics.snapshot())
    }

    /// Reserve a slot on `agent`, returning `false` if it was already at
    /// capacity (guards the race between `eligible_for` and dispatch).
    pub async fn try_reserve(&self, agent: &AgentEntry) -> bool {
        loop {
            let current = agent.metrics.in_flight.load(Ordering::Acquire);
            if current >= agent.spec.max_concurrent_tasks {
                return false;
            }
            if agent
                .metrics
                .in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let mut state = agent.state.write().await;
                if current + 1 >= agent.spec.max_concurrent_tasks {
                    *state = AgentState::Busy;
                } else {
                    *state = AgentState::Idle;
                }
                agent.metrics.touch();
                return true;
            }
        }
    }

    pub async fn release(&self, agent: &AgentEntry, succeeded: bool, latency: Duration) {
        agent.metrics.in_flight.fetch_sub(1, Ordering::AcqRel);
        if succeeded {
            agent.metrics.completed_count.fetch_add(1, Ordering::Relaxed);
        } else {
            agent.metrics.failed_count.fetch_add(1, Ordering::Relaxed);
        }
        agent
            .metrics
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        agent.metrics.touch();

        let mut state = agent.state.write().await;
        if *state != AgentState::Error {
            *state = AgentState::Idle;
        }
    }

    pub async fn set_state(&self, agent_id: &str, state: AgentState) {
        if let Some(agent) = self.get(agent_id) {
            *agent.state.write().await = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn handle(
            &self,
            task: &Task,
            _ctx: &TaskContext,
            _router: &ModelRouter,
        ) -> Result<AgentOutput, RuntimeError> {
            Ok(AgentOutput {
                content: format!("echo:{}", task.id),
                reasoning: None,
                tokens_in: 1,
                tokens_out: 1,
                cost: 0.0,
                backend_id: "none".to_string(),
                stop: false,
            })
        }
    }

    fn make_pool() -> AgentPool {
        let pool = AgentPool::new();
        let mut spec = AgentSpec::new("backend-dev", vec!["code".to_string(), "chat".to_string()]);
        spec.max_concurrent_tasks = 1;
        pool.register(spec, Arc::new(EchoAgent));
        pool
    }

    #[tokio::test]
    async fn eligible_for_respects_capability_and_cap() {
        let pool = make_pool();
        let eligible = pool.eligible_for("code").await;
        assert_eq!(eligible.len(), 1);

        let agent = eligible[0].clone();
        assert!(pool.try_reserve(&agent).await);
        assert!(pool.eligible_for("code").await.is_empty());

        pool.release(&agent, true, Duration::from_millis(5)).await;
        assert_eq!(pool.eligible_for("code").await.len(), 1);
    }

    #[tokio::test]
    async fn paused_agent_is_skipped() {
        let pool = make_pool();
        pool.set_state("backend-dev", AgentState::Paused).await;
        assert!(pool.eligible_for("code").await.is_empty());
    }

    #[tokio::test]
    async fn metrics_snapshot_tracks_completion() {
        let pool = make_pool();
        let agent = pool.get("backend-dev").unwrap();
        pool.try_reserve(&agent).await;
        pool.release(&agent, true, Duration::from_millis(42)).await;

        let snapshot = pool.metrics_snapshot("backend-dev").await.unwrap();
        assert_eq!(snapshot.completed_count, 1);
        assert_eq!(snapshot.failed_count, 0);
        assert_eq!(snapshot.total_latency_ms, 42);
        assert_eq!(snapshot.in_flight, 0);
    }
}
