//! Task and TaskResult entities, per spec §3.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority band. Lower runs first; `0` is critical, `3` is low.
pub const PRIORITY_BANDS: u8 = 4;

/// Tagged task payload. Internally tagged variants are preferred to an
/// open map (spec §9, "dynamic typing of payloads"); the boundary is
/// responsible for validating an inbound payload against a per-`kind`
/// schema before it becomes one of these variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Code { input: String, language: Option<String> },
    Chat { input: String },
    Embed { input: String },
    Custom { value: serde_json::Value },
}

impl TaskPayload {
    /// The capability this payload variant requires from an agent/backend.
    pub fn required_capability(&self) -> &'static str {
        match self {
            TaskPayload::Code { .. } => "code",
            TaskPayload::Chat { .. } => "chat",
            TaskPayload::Embed { .. } => "embed",
            TaskPayload::Custom { .. } => "custom",
        }
    }
}

/// Target of a task dispatch: a specific agent, or any capable one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentTarget {
    Any,
    Specific(String),
}

/// Lifecycle status of a Task. Transitions are monotonic; terminal states
/// are final (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One unit of work, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: Option<String>,
    pub agent_target: AgentTarget,
    pub kind: String,
    pub priority: u8,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(kind: impl Into<String>, priority: u8, payload: TaskPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            agent_target: AgentTarget::Any,
            kind: kind.into(),
            priority: priority.min(PRIORITY_BANDS - 1),
            payload,
            created_at: Utc::now(),
            deadline: None,
            status: TaskStatus::Queued,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_target(mut self, target: AgentTarget) -> Self {
        self.agent_target = target;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Per spec §8 boundary behavior: a deadline at or before creation time
    /// is invalid and the task must fail immediately without dispatch.
    pub fn deadline_already_passed(&self) -> bool {
        match self.deadline {
            Some(d) => d <= self.created_at || d <= Utc::now(),
            None => false,
        }
    }

    pub fn required_capability(&self) -> &'static str {
        self.payload.required_capability()
    }
}

/// Outcome of a terminal Task, per spec §3. Exactly one exists per
/// terminated Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub status: TaskStatus,
    pub content: Option<String>,
    pub reasoning: Option<Vec<String>>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub backend_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Machine-readable failure reason, e.g. `"DEADLINE_EXCEEDED"`,
    /// `"NO_BACKEND_AVAILABLE"`. Empty for successful results.
    pub reason: Option<String>,
    /// Carried from `AgentOutput::stop`. Consulted by a CASCADE
    /// collaboration to end early; meaningless outside that context.
    pub stop: bool,
}

impl TaskResult {
    #[allow(clippy::too_many_arguments)]
    pub fn success(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: String,
        tokens_in: u32,
        tokens_out: u32,
        cost: f64,
        backend_id: impl Into<String>,
        started_at: DateTime<Utc>,
        stop: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: Some(agent_id.into()),
            status: TaskStatus::Completed,
            content: Some(content),
            reasoning: None,
            tokens_in,
            tokens_out,
            cost,
            backend_id: Some(backend_id.into()),
            started_at,
            finished_at: Utc::now(),
            reason: None,
            stop,
        }
    }

    pub fn failure(task_id: impl Into<String>, reason: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: None,
            status: TaskStatus::Failed,
            content: None,
            reasoning: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            backend_id: None,
            started_at,
            finished_at: Utc::now(),
            reason: Some(reason.into()),
            stop: false,
        }
    }

    pub fn latency(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_clamps_priority_to_band_range() {
        let task = Task::new("code_analyze", 9, TaskPayload::Chat { input: "hi".into() });
        assert_eq!(task.priority, PRIORITY_BANDS - 1);
    }

    #[test]
    fn deadline_in_the_past_is_detected() {
        let mut task = Task::new("chat", 1, TaskPayload::Chat { input: "hi".into() });
        task.deadline = Some(task.created_at - chrono::Duration::seconds(1));
        assert!(task.deadline_already_passed());
    }

    #[test]
    fn payload_maps_to_capability() {
        let task = Task::new(
            "code_analyze",
            0,
            TaskPayload::Code {
                input: "fn main() {}".into(),
                language: Some("rust".into()),
            },
        );
        assert_eq!(task.required_capability(), "code");
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn failure_result_carries_reason() {
        let result = TaskResult::failure("t1", "DEADLINE_EXCEEDED", Utc::now());
        assert!(!result.stop);
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("DEADLINE_EXCEEDED"));
    }
}
