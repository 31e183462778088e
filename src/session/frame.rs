//! Length-prefixed JSON envelope framing for the session transport, per
//! spec §6.1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::task::TaskPayload;
use crate::agent::task::TaskStatus;
use crate::collaboration::{ResolutionPolicy, Strategy};

/// The wire envelope every inbound and outbound frame is wrapped in:
/// `{ "v": 1, "type": "...", "id": "...", "ts": <unix_ms>, "body": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub ts: i64,
    pub body: Value,
}

impl Envelope {
    pub fn outbound(kind: &str, correlation_id: &str, body: &OutboundBody) -> Self {
        Self {
            v: 1,
            kind: kind.to_string(),
            id: correlation_id.to_string(),
            ts: Utc::now().timestamp_millis(),
            body: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }

    /// Length-prefix this envelope for a byte transport: 4-byte big-endian
    /// length followed by UTF-8 JSON (spec §6.1).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        let mut framed = Vec::with_capacity(4 + json.len());
        framed.extend_from_slice(&(json.len() as u32).to_be_bytes());
        framed.extend_from_slice(&json);
        Ok(framed)
    }

    pub fn decode(framed: &[u8]) -> Result<Option<(Self, usize)>, serde_json::Error> {
        if framed.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        if framed.len() < 4 + len {
            return Ok(None);
        }
        let envelope: Self = serde_json::from_slice(&framed[4..4 + len])?;
        Ok(Some((envelope, 4 + len)))
    }
}

/// Parsed inbound frame kinds, per spec §4.4.
#[derive(Debug, Clone)]
pub enum InboundBody {
    SubmitTask {
        kind: String,
        payload: TaskPayload,
        target_agent_id: Option<String>,
        priority: Option<u8>,
        deadline: Option<DateTime<Utc>>,
    },
    SubmitCollab {
        participants: Vec<String>,
        strategy: Strategy,
        resolution_policy: ResolutionPolicy,
        prompt: String,
        deadline: Option<DateTime<Utc>>,
    },
    Cancel { id: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    ActivateAgent { agent_id: String },
    Heartbeat,
    /// Resolves a collaboration suspended on `HUMAN` resolution by naming
    /// the winning participant's agent id. Not named in the original
    /// closed inbound frame list; added because `HUMAN` resolution (spec
    /// §4.3) requires a "decision event" the wire vocabulary otherwise has
    /// no way to express (see DESIGN.md's open question decisions).
    HumanDecision { collab_id: String, agent_id: String },
}

#[derive(Debug, Deserialize)]
struct SubmitTaskBody {
    kind: String,
    payload: TaskPayload,
    target_agent_id: Option<String>,
    priority: Option<u8>,
    deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SubmitCollabBody {
    participants: Vec<String>,
    strategy: Strategy,
    resolution_policy: ResolutionPolicy,
    prompt: String,
    deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(alias = "task_id", alias = "collab_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct TopicBody {
    topic: String,
}

#[derive(Debug, Deserialize)]
struct ActivateAgentBody {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct HumanDecisionBody {
    collab_id: String,
    agent_id: String,
}

/// Returns `None` for an unrecognized frame type; the caller reports
/// `UNKNOWN_FRAME` (spec §6.1).
pub fn parse_inbound(envelope: &Envelope) -> Option<InboundBody> {
    match envelope.kind.as_str() {
        "submit_task" => {
            let b: SubmitTaskBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::SubmitTask {
                kind: b.kind,
                payload: b.payload,
                target_agent_id: b.target_agent_id,
                priority: b.priority,
                deadline: b.deadline,
            })
        }
        "submit_collab" => {
            let b: SubmitCollabBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::SubmitCollab {
                participants: b.participants,
                strategy: b.strategy,
                resolution_policy: b.resolution_policy,
                prompt: b.prompt,
                deadline: b.deadline,
            })
        }
        "cancel" => {
            let b: CancelBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::Cancel { id: b.id })
        }
        "subscribe" => {
            let b: TopicBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::Subscribe { topic: b.topic })
        }
        "unsubscribe" => {
            let b: TopicBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::Unsubscribe { topic: b.topic })
        }
        "activate_agent" => {
            let b: ActivateAgentBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::ActivateAgent { agent_id: b.agent_id })
        }
        "heartbeat" => Some(InboundBody::Heartbeat),
        "human_decision" => {
            let b: HumanDecisionBody = serde_json::from_value(envelope.body.clone()).ok()?;
            Some(InboundBody::HumanDecision { collab_id: b.collab_id, agent_id: b.agent_id })
        }
        _ => None,
    }
}

/// Outbound frame bodies, per spec §4.4's outbound kind list.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundBody {
    Ack { id: String },
    TaskCompleted { task_id: String, content: Option<String> },
    TaskFailed { task_id: String, reason: Option<String> },
    ParticipantProgress { agent_id: String, partial: String },
    ParticipantCompleted { agent_id: String, content: String },
    CollabFinished { status: TaskStatus, content: Option<String> },
    ResolutionChosen { policy: ResolutionPolicy, class: Option<String> },
    AwaitingHuman,
    AgentActivated { agent_id: String },
    Error { code: String, message: String },
    Heartbeat,
}

impl OutboundBody {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundBody::Ack { .. } => "ack",
            OutboundBody::TaskCompleted { .. } => "task_completed",
            OutboundBody::TaskFailed { .. } => "task_failed",
            OutboundBody::ParticipantProgress { .. } => "participant_progress",
            OutboundBody::ParticipantCompleted { .. } => "participant_completed",
            OutboundBody::CollabFinished { .. } => "collab_finished",
            OutboundBody::ResolutionChosen { .. } => "resolution_chosen",
            OutboundBody::AwaitingHuman => "awaiting_human",
            OutboundBody::AgentActivated { .. } => "agent_activated",
            OutboundBody::Error { .. } => "error",
            OutboundBody::Heartbeat => "heartbeat",
        }
    }

    /// Terminal events are exempt from the back-pressure drop policy (spec
    /// §4.4).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboundBody::TaskCompleted { .. }
                | OutboundBody::TaskFailed { .. }
                | OutboundBody::CollabFinished { .. }
                | OutboundBody::Error { .. }
        )
    }
}
