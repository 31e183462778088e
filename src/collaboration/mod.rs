//! Collaboration Engine (C10): orchestrates multi-agent jobs under a named
//! strategy and reconciles divergent outputs with a resolution policy, per
//! spec §4.3.

pub mod resolution;
pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agent::coordinator::{AgentCoordinator, TaskEvent};
use crate::agent::task::{Task, TaskPayload, TaskStatus};
use crate::agent::AgentPool;
use crate::error::RuntimeError;
use crate::metrics::{names, MetricsSink};
use crate::storage::ResultStore;

pub use resolution::{EquivalenceFn, ResolutionPolicy};
pub use strategy::Strategy;

/// A single agent's candidate output within a collaboration, per spec §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantOutput {
    pub agent_id: String,
    pub content: String,
    pub confidence: f64,
    /// The participant's expertise weight at the time it ran, consulted by
    /// `EXPERTISE_WEIGHTED` resolution (spec §4.3). Copied from
    /// `AgentSpec.expertise_weight` rather than looked up again at
    /// resolution time, so a late agent registry change can't retroactively
    /// change a vote already cast.
    pub expertise_weight: f64,
    pub stop: bool,
}

/// A request to run a multi-agent collaboration (spec §3).
#[derive(Debug, Clone)]
pub struct CollaborationRequest {
    pub id: String,
    pub session_id: Option<String>,
    pub prompt: String,
    pub participants: Vec<String>,
    pub strategy: Strategy,
    pub resolution_policy: ResolutionPolicy,
    pub deadline: Option<DateTime<Utc>>,
}

impl CollaborationRequest {
    pub fn new(
        prompt: impl Into<String>,
        participants: Vec<String>,
        strategy: Strategy,
        resolution_policy: ResolutionPolicy,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            prompt: prompt.into(),
            participants,
            strategy,
            resolution_policy,
            deadline: None,
        }
    }
}

/// The final outcome of a terminated CollaborationRequest (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabResult {
    pub collab_id: String,
    pub status: TaskStatus,
    pub terminal_content: Option<String>,
    pub sub_results: Vec<ParticipantOutput>,
    pub resolution_policy: Option<ResolutionPolicy>,
    pub reason: Option<String>,
}

/// Events emitted as a collaboration progresses, consumed by the Session
/// Hub (spec §4.3 "Event emission").
#[derive(Debug, Clone)]
pub enum CollabEvent {
    Started { collab_id: String },
    ParticipantProgress { collab_id: String, agent_id: String, partial: String },
    ParticipantCompleted { collab_id: String, output: ParticipantOutput },
    ResolutionChosen { collab_id: String, policy: ResolutionPolicy, class: Option<String> },
    AwaitingHuman { collab_id: String },
    Finished { collab_id: String, result: CollabResult },
}

/// Default suspension budget for a HUMAN resolution with no request
/// deadline (spec §4.3 names no default; five minutes matches the
/// collaboration deadline default in `config.rs`).
const DEFAULT_HUMAN_DECISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs collaborations over the Agent Coordinator / Agent Pool, per
/// spec §4.3.
pub struct CollaborationEngine {
    coordinator: Arc<AgentCoordinator>,
    pool: Arc<AgentPool>,
    store: Arc<dyn ResultStore>,
    metrics: Arc<dyn MetricsSink>,
    events: broadcast::Sender<CollabEvent>,
    live: Arc<DashMap<String, ()>>,
    /// Collaborations currently suspended on `HUMAN` resolution, keyed by
    /// collab id. `submit_human_decision` resolves the sender with the
    /// chosen participant's agent id.
    pending_human: DashMap<String, tokio::sync::oneshot::Sender<String>>,
}

impl CollaborationEngine {
    pub fn new(
        coordinator: Arc<AgentCoordinator>,
        pool: Arc<AgentPool>,
        store: Arc<dyn ResultStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            coordinator,
            pool,
            store,
            metrics,
            events,
            live: Arc::new(DashMap::new()),
            pending_human: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    /// Deliver a human decision for a collaboration suspended awaiting one.
    /// Returns `false` if no such collaboration is currently awaiting a
    /// decision (already resolved, timed out, or unknown id).
    pub fn submit_human_decision(&self, collab_id: &str, agent_id: &str) -> bool {
        match self.pending_human.remove(collab_id) {
            Some((_, tx)) => tx.send(agent_id.to_string()).is_ok(),
            None => false,
        }
    }

    /// Run a collaboration to completion. Rejects with `Duplicate` if
    /// `request.id` is already live (spec §4.3 idempotence).
    pub async fn run(&self, request: CollaborationRequest) -> Result<CollabResult, RuntimeError> {
        if self.live.contains_key(&request.id) {
            return Err(RuntimeError::Duplicate { id: request.id.clone() });
        }
        self.live.insert(request.id.clone(), ());
        let result = self.run_inner(&request).await;
        self.live.remove(&request.id);
        let result = result?;

        self.store.put_collab_result(result.clone()).await;
        let _ = self.events.send(CollabEvent::Finished {
            collab_id: request.id.clone(),
            result: result.clone(),
        });
        Ok(result)
    }

    async fn run_inner(&self, request: &CollaborationRequest) -> Result<CollabResult, RuntimeError> {
        let labels = crate::labels! { "strategy" => format!("{:?}", request.strategy) };
        self.metrics.incr_counter(names::COLLAB_STARTED_TOTAL, &labels, 1);
        let _ = self.events.send(CollabEvent::Started {
            collab_id: request.id.clone(),
        });
        info!(collab_id = %request.id, strategy = ?request.strategy, "collaboration started");

        let outputs = match request.strategy {
            Strategy::Sequential => self.run_sequential(request, false).await?,
            Strategy::Cascade => self.run_sequential(request, true).await?,
            Strategy::Parallel => self.run_parallel(request).await?,
            Strategy::Swarm => {
                let mut outputs = self.run_parallel(request).await?;
                let reconciled = self.invoke_coordinator(request, &outputs).await?;
                outputs.push(reconciled);
                outputs
            }
        };

        if outputs.is_empty() {
            return Ok(CollabResult {
                collab_id: request.id.clone(),
                status: TaskStatus::Failed,
                terminal_content: None,
                sub_results: Vec::new(),
                resolution_policy: None,
                reason: Some("ALL_PARTICIPANTS_FAILED".to_string()),
            });
        }

        let terminal = match request.strategy {
            Strategy::Sequential | Strategy::Cascade => outputs.last().cloned(),
            Strategy::Swarm => outputs.last().cloned(),
            Strategy::Parallel => {
                let (chosen, policy, class) = resolution::resolve(
                    &request.resolution_policy,
                    &outputs,
                    request.deadline,
                );
                let _ = self.events.send(CollabEvent::ResolutionChosen {
                    collab_id: request.id.clone(),
                    policy,
                    class: class.clone(),
                });
                match policy {
                    ResolutionPolicy::Arbitration => Some(self.invoke_coordinator(request, &outputs).await?),
                    ResolutionPolicy::Human => Some(self.await_human_decision(request, &outputs).await?),
                    _ => chosen,
                }
            }
        };

        Ok(CollabResult {
            collab_id: request.id.clone(),
            status: TaskStatus::Completed,
            terminal_content: terminal.as_ref().map(|o| o.content.clone()),
            sub_results: outputs,
            resolution_policy: Some(request.resolution_policy),
            reason: None,
        })
    }

    async fn run_sequential(
        &self,
        request: &CollaborationRequest,
        cascade: bool,
    ) -> Result<Vec<ParticipantOutput>, RuntimeError> {
        let mut outputs = Vec::new();
        let mut running_prompt = request.prompt.clone();

        for agent_id in &request.participants {
            let output = self
                .run_one_participant(request, agent_id, &running_prompt)
                .await;
            match output {
                Some(out) => {
                    running_prompt = format!("{}\n{}", running_prompt, out.content);
                    let stop = out.stop;
                    outputs.push(out);
                    if cascade && stop {
                        break;
                    }
                }
                None => warn!(collab_id = %request.id, agent_id = %agent_id, "participant failed"),
            }
        }
        Ok(outputs)
    }

    async fn run_parallel(&self, request: &CollaborationRequest) -> Result<Vec<ParticipantOutput>, RuntimeError> {
        let mut handles = Vec::new();
        for agent_id in &request.participants {
            let agent_id = agent_id.clone();
            let prompt = request.prompt.clone();
            let this = self.clone_handles();
            let request_id = request.id.clone();
            let deadline = request.deadline;
            handles.push(tokio::spawn(async move {
                this.run_one_participant_owned(request_id, agent_id, prompt, deadline).await
            }));
        }

        let mut outputs = Vec::new();
        for handle in handles {
            if let Ok(Some(output)) = handle.await {
                let _ = self.events.send(CollabEvent::ParticipantCompleted {
                    collab_id: request.id.clone(),
                    output: output.clone(),
                });
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    async fn run_one_participant(
        &self,
        request: &CollaborationRequest,
        agent_id: &str,
        prompt: &str,
    ) -> Option<ParticipantOutput> {
        let output = self
            .run_one_participant_owned(request.id.clone(), agent_id.to_string(), prompt.to_string(), request.deadline)
            .await;
        if let Some(ref out) = output {
            let _ = self.events.send(CollabEvent::ParticipantCompleted {
                collab_id: request.id.clone(),
                output: out.clone(),
            });
        }
        output
    }

    /// Clone just what a spawned task needs, avoiding `Arc<Self>` at the
    /// API boundary (the engine itself isn't handed out as an `Arc`).
    fn clone_handles(&self) -> EngineHandles {
        EngineHandles {
            coordinator: Arc::clone(&self.coordinator),
            pool: Arc::clone(&self.pool),
            events: self.events.clone(),
        }
    }

    async fn run_one_participant_owned(
        &self,
        collab_id: String,
        agent_id: String,
        prompt: String,
        deadline: Option<DateTime<Utc>>,
    ) -> Option<ParticipantOutput> {
        self.clone_handles()
            .run_one_participant_owned(collab_id, agent_id, prompt, deadline)
            .await
    }

    async fn invoke_coordinator(
        &self,
        request: &CollaborationRequest,
        candidates: &[ParticipantOutput],
    ) -> Result<ParticipantOutput, RuntimeError> {
        let joined = candidates
            .iter()
            .map(|c| format!("[{}] {}", c.agent_id, c.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!("{}\n---\n{}", request.prompt, joined);

        let coordinator_agent = self
            .pool
            .eligible_for("custom")
            .await
            .into_iter()
            .find(|a| a.spec.id == "coordinator" || a.spec.display_name == "COORDINATOR")
            .or_else(|| self.pool.get("coordinator"));

        let agent_id = coordinator_agent
            .map(|a| a.spec.id.clone())
            .ok_or_else(|| RuntimeError::NoAgent {
                capability: "COORDINATOR".to_string(),
            })?;

        self.run_one_participant_owned(request.id.clone(), agent_id, prompt, request.deadline)
            .await
            .ok_or(RuntimeError::NoAgent {
                capability: "COORDINATOR".to_string(),
            })
    }

    /// Suspend a PARALLEL collaboration for a `HUMAN` decision, per spec
    /// §4.3: emit `awaiting_human`, wait up to the request deadline (or
    /// `DEFAULT_HUMAN_DECISION_TIMEOUT` if none was given) for
    /// `submit_human_decision` to name a winning participant, and fall back
    /// to `ARBITRATION` on timeout or an unrecognized agent id.
    async fn await_human_decision(
        &self,
        request: &CollaborationRequest,
        candidates: &[ParticipantOutput],
    ) -> Result<ParticipantOutput, RuntimeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending_human.insert(request.id.clone(), tx);
        let _ = self.events.send(CollabEvent::AwaitingHuman {
            collab_id: request.id.clone(),
        });
        info!(collab_id = %request.id, "awaiting human decision");

        let timeout_budget = request
            .deadline
            .and_then(|d| (d - Utc::now()).to_std().ok())
            .unwrap_or(DEFAULT_HUMAN_DECISION_TIMEOUT);

        let decided = tokio::time::timeout(timeout_budget, rx).await.ok().and_then(|r| r.ok());
        self.pending_human.remove(&request.id);

        match decided.and_then(|agent_id| candidates.iter().find(|c| c.agent_id == agent_id).cloned()) {
            Some(output) => Ok(output),
            None => {
                warn!(collab_id = %request.id, "human decision timed out or was invalid, falling back to arbitration");
                self.invoke_coordinator(request, candidates).await
            }
        }
    }
}

/// The minimal state a spawned participant task needs, decoupled from the
/// engine's `&self` borrow so `tokio::spawn` gets a `'static` future.
struct EngineHandles {
    coordinator: Arc<AgentCoordinator>,
    pool: Arc<AgentPool>,
    events: broadcast::Sender<CollabEvent>,
}

impl EngineHandles {
    async fn run_one_participant_owned(
        &self,
        collab_id: String,
        agent_id: String,
        prompt: String,
        deadline: Option<DateTime<Utc>>,
    ) -> Option<ParticipantOutput> {
        let _ = self.events.send(CollabEvent::ParticipantProgress {
            collab_id: collab_id.clone(),
            agent_id: agent_id.clone(),
            partial: String::new(),
        });

        let mut task = Task::new("chat", 1, TaskPayload::Chat { input: prompt })
            .with_session(collab_id.clone())
            .with_target(crate::agent::task::AgentTarget::Specific(agent_id.clone()));
        if let Some(deadline) = deadline {
            task = task.with_deadline(deadline);
        }
        let task_id = task.id.clone();

        let mut events = self.coordinator.subscribe();
        if self.coordinator.submit(task).await.is_err() {
            return None;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(TaskEvent::Completed { result }) if result.task_id == task_id => {
                        return Some(result);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        let timeout = deadline
            .and_then(|d| (d - Utc::now()).to_std().ok())
            .unwrap_or(Duration::from_secs(120));
        let result = tokio::time::timeout(timeout, wait).await.ok().flatten()?;

        if result.status != TaskStatus::Completed {
            return None;
        }
        let expertise_weight = self.pool.get(&agent_id).map(|a| a.spec.expertise_weight).unwrap_or(1.0);
        Some(ParticipantOutput {
            agent_id,
            content: result.content.unwrap_or_default(),
            confidence: 1.0,
            expertise_weight,
            stop: result.stop,
        })
    }
}

/// Distinct content classes among a set of participant outputs, per the
/// default `equivalence_fn` (byte-identical after trimming and collapsing
/// internal whitespace; spec §4.3).
pub fn equivalence_classes<'a>(
    outputs: &'a [ParticipantOutput],
    equivalence_fn: &EquivalenceFn,
) -> Vec<Vec<&'a ParticipantOutput>> {
    let mut classes: Vec<Vec<&ParticipantOutput>> = Vec::new();
    'outer: for output in outputs {
        for class in classes.iter_mut() {
            if equivalence_fn(&class[0].content, &output.content) {
                class.push(output);
                continue 'outer;
            }
        }
        classes.push(vec![output]);
    }
    classes
}

pub fn default_equivalence(a: &str, b: &str) -> bool {
    fn normalize(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }
    normalize(a) == normalize(b)
}
