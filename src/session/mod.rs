//! Session Hub (C11): durable bidirectional client connections, per
//! spec §4.4.

pub mod frame;
pub mod mailbox;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::agent::coordinator::AgentCoordinator;
use crate::agent::task::{AgentTarget, Task};
use crate::auth::{Authorizer, Decision};
use crate::collaboration::{CollabEvent, CollaborationEngine, CollaborationRequest};
use crate::error::RuntimeError;
use crate::metrics::{names, MetricsSink};
use crate::resilience::RateLimiter;

pub use frame::Envelope;
use frame::{InboundBody, OutboundBody};
pub use mailbox::MailboxReceiver;
use mailbox::{Mailbox, OfferOutcome};

/// Per-session mailbox capacity (spec §4.4 default).
pub const DEFAULT_MAILBOX_SIZE: usize = 256;

/// Why a session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientRequested,
    SlowConsumer,
    UnsupportedProtocol,
}

/// Per-session state owned by the Hub (spec §3).
struct SessionState {
    id: String,
    principal: String,
    active_agents: DashMap<String, ()>,
    subscriptions: DashMap<String, ()>,
    outbound: Arc<Mailbox>,
    queued_task_ids: DashMap<String, ()>,
}

/// Accepts connections, holds per-session state, and routes frames to the
/// Agent Coordinator / Collaboration Engine (spec §4.4).
pub struct SessionHub {
    coordinator: Arc<AgentCoordinator>,
    collaboration: Arc<CollaborationEngine>,
    authorizer: Arc<dyn Authorizer>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    sessions: DashMap<String, Arc<SessionState>>,
    mailbox_size: usize,
    default_task_deadline: Duration,
    default_collab_deadline: Duration,
    open_sessions: AtomicU64,
}

impl SessionHub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: Arc<AgentCoordinator>,
        collaboration: Arc<CollaborationEngine>,
        authorizer: Arc<dyn Authorizer>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<dyn MetricsSink>,
        mailbox_size: usize,
        default_task_deadline: Duration,
        default_collab_deadline: Duration,
    ) -> Self {
        Self {
            coordinator,
            collaboration,
            authorizer,
            rate_limiter,
            metrics,
            sessions: DashMap::new(),
            mailbox_size,
            default_task_deadline,
            default_collab_deadline,
            open_sessions: AtomicU64::new(0),
        }
    }

    /// Open a new session for `principal`, returning its id and the
    /// receiving half of its outbound mailbox. The caller is expected to
    /// drain the receiver on its own writer task (spec §5: "session writer
    /// runs on its own scheduled execution context").
    pub fn open(&self, principal: impl Into<String>) -> (String, MailboxReceiver) {
        let id = uuid::Uuid::new_v4().to_string();
        let (mailbox, receiver) = Mailbox::new(self.mailbox_size);
        let state = Arc::new(SessionState {
            id: id.clone(),
            principal: principal.into(),
            active_agents: DashMap::new(),
            subscriptions: DashMap::new(),
            outbound: mailbox,
            queued_task_ids: DashMap::new(),
        });
        self.sessions.insert(id.clone(), state);
        self.open_sessions.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .incr_counter(names::SESSIONS_OPENED_TOTAL, &crate::labels! {}, 1);
        self.metrics.set_gauge(
            names::OPEN_SESSIONS,
            &crate::labels! {},
            self.open_sessions.load(Ordering::Relaxed) as f64,
        );
        info!(session_id = %id, "session opened");
        (id, receiver)
    }

    /// Close a session: cancel its still-queued tasks, release its active
    /// agents, drop any in-flight outbound events (spec §4.4 connection
    /// lifecycle).
    pub async fn close(&self, session_id: &str, reason: CloseReason) {
        if let Some((_, state)) = self.sessions.remove(session_id) {
            state.outbound.close().await;
            for entry in state.queued_task_ids.iter() {
                self.coordinator.cancel(entry.key()).await;
            }
            self.open_sessions.fetch_sub(1, Ordering::Relaxed);
            self.metrics.set_gauge(
                names::OPEN_SESSIONS,
                &crate::labels! {},
                self.open_sessions.load(Ordering::Relaxed) as f64,
            );
            info!(session_id = %session_id, reason = ?reason, "session closed");
        }
    }

    /// Handle one inbound envelope. Performs the authorize/rate-limit
    /// checkpoints before touching any downstream component (spec §4.4).
    pub async fn inbound(&self, session_id: &str, envelope: Envelope) {
        let Some(state) = self.sessions.get(session_id).map(|e| e.value().clone()) else {
            return;
        };

        if envelope.v != 1 {
            self.deliver(&state, OutboundBody::Error {
                code: "UNSUPPORTED_PROTOCOL".to_string(),
                message: format!("unsupported envelope version {}", envelope.v),
            }, &envelope.id)
                .await;
            self.close(session_id, CloseReason::UnsupportedProtocol).await;
            return;
        }

        let body = match frame::parse_inbound(&envelope) {
            Some(body) => body,
            None => {
                self.deliver(&state, OutboundBody::Error {
                    code: "UNKNOWN_FRAME".to_string(),
                    message: format!("unrecognized frame type '{}'", envelope.kind),
                }, &envelope.id)
                    .await;
                return;
            }
        };

        let action = envelope.kind.clone();
        if self.authorizer.authorize(&state.principal, &action, None).await == Decision::Deny {
            self.deliver(&state, OutboundBody::Error {
                code: "FORBIDDEN".to_string(),
                message: "not authorized".to_string(),
            }, &envelope.id)
                .await;
            return;
        }

        let (allowed, retry_after) = self.rate_limiter.check(&state.principal, 1);
        if !allowed {
            self.deliver(&state, OutboundBody::Error {
                code: "RATE_LIMITED".to_string(),
                message: format!("retry after {}ms", retry_after.as_millis()),
            }, &envelope.id)
                .await;
            return;
        }

        self.handle_body(&state, body, &envelope.id).await;
    }

    async fn handle_body(&self, state: &Arc<SessionState>, body: InboundBody, correlation_id: &str) {
        match body {
            InboundBody::SubmitTask { kind, payload, target_agent_id, priority, deadline } => {
                let mut task = Task::new(kind, priority.unwrap_or(crate::config::DEFAULT_PRIORITY_BAND), payload)
                    .with_session(state.id.clone());
                if let Some(agent_id) = target_agent_id {
                    task = task.with_target(AgentTarget::Specific(agent_id));
                }
                let deadline = deadline.or_else(|| {
                    chrono::Duration::from_std(self.default_task_deadline)
                        .ok()
                        .map(|d| Utc::now() + d)
                });
                if let Some(deadline) = deadline {
                    task = task.with_deadline(deadline);
                }
                let task_id = task.id.clone();
                state.queued_task_ids.insert(task_id.clone(), ());

                match self.coordinator.submit(task).await {
                    Ok(()) => {
                        self.deliver(state, OutboundBody::Ack { id: task_id }, correlation_id).await;
                    }
                    Err(err) => {
                        state.queued_task_ids.remove(&task_id);
                        self.deliver(
                            state,
                            OutboundBody::Error {
                                code: error_code(&err),
                                message: err.to_string(),
                            },
                            correlation_id,
                        )
                        .await;
                    }
                }
            }
            InboundBody::SubmitCollab { participants, strategy, resolution_policy, prompt, deadline } => {
                let mut request = CollaborationRequest::new(prompt, participants, strategy, resolution_policy);
                request.session_id = Some(state.id.clone());
                request.deadline = deadline.or_else(|| {
                    chrono::Duration::from_std(self.default_collab_deadline)
                        .ok()
                        .map(|d| Utc::now() + d)
                });
                let collab_id = request.id.clone();
                self.deliver(state, OutboundBody::Ack { id: collab_id.clone() }, correlation_id)
                    .await;

                let engine = Arc::clone(&self.collaboration);
                let hub_state = Arc::clone(state);
                let session_hub_events = engine.subscribe();
                tokio::spawn(Self::drive_collab(engine, request, hub_state, session_hub_events));
            }
            InboundBody::Cancel { id } => {
                state.queued_task_ids.remove(&id);
                self.coordinator.cancel(&id).await;
            }
            InboundBody::Subscribe { topic } => {
                state.subscriptions.insert(topic, ());
            }
            InboundBody::Unsubscribe { topic } => {
                state.subscriptions.remove(&topic);
            }
            InboundBody::ActivateAgent { agent_id } => {
                state.active_agents.insert(agent_id.clone(), ());
                self.deliver(state, OutboundBody::AgentActivated { agent_id }, correlation_id)
                    .await;
            }
            InboundBody::Heartbeat => {
                self.deliver(state, OutboundBody::Heartbeat, correlation_id).await;
            }
            InboundBody::HumanDecision { collab_id, agent_id } => {
                if self.collaboration.submit_human_decision(&collab_id, &agent_id) {
                    self.deliver(state, OutboundBody::Ack { id: collab_id }, correlation_id).await;
                } else {
                    self.deliver(
                        state,
                        OutboundBody::Error {
                            code: "NOT_AWAITING_HUMAN".to_string(),
                            message: format!("collaboration '{collab_id}' is not awaiting a human decision"),
                        },
                        correlation_id,
                    )
                    .await;
                }
            }
        }
    }

    async fn drive_collab(
        engine: Arc<CollaborationEngine>,
        request: CollaborationRequest,
        state: Arc<SessionState>,
        mut events: tokio::sync::broadcast::Receiver<CollabEvent>,
    ) {
        let collab_id = request.id.clone();
        let run_handle = tokio::spawn(async move { engine.run(request).await });

        loop {
            match events.recv().await {
                Ok(event) => {
                    if Self::event_collab_id(&event) != collab_id {
                        continue;
                    }
                    let is_terminal = matches!(event, CollabEvent::Finished { .. });
                    Self::deliver_static(&state, collab_event_body(event)).await;
                    if is_terminal {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = run_handle.await;
    }

    fn event_collab_id(event: &CollabEvent) -> String {
        match event {
            CollabEvent::Started { collab_id }
            | CollabEvent::ParticipantProgress { collab_id, .. }
            | CollabEvent::ParticipantCompleted { collab_id, .. }
            | CollabEvent::ResolutionChosen { collab_id, .. }
            | CollabEvent::AwaitingHuman { collab_id }
            | CollabEvent::Finished { collab_id, .. } => collab_id.clone(),
        }
    }

    /// Deliver one outbound frame, applying the back-pressure policy of
    /// spec §4.4 if the mailbox is full: drop coalesced `participant_progress`,
    /// then `heartbeat`, then close with `SLOW_CONSUMER`. Terminal events are
    /// never dropped.
    async fn deliver(&self, state: &Arc<SessionState>, body: OutboundBody, correlation_id: &str) {
        Self::deliver_with(state, body, correlation_id, Some(self)).await;
    }

    async fn deliver_static(state: &Arc<SessionState>, body: OutboundBody) {
        Self::deliver_with(state, body, "", None).await;
    }

    async fn deliver_with(
        state: &Arc<SessionState>,
        body: OutboundBody,
        correlation_id: &str,
        hub: Option<&SessionHub>,
    ) {
        let is_terminal = body.is_terminal();
        let envelope = Envelope::outbound(body.kind(), correlation_id, &body);
        match state.outbound.offer(envelope, is_terminal).await {
            OfferOutcome::Delivered => {}
            OfferOutcome::Evicted { evicted_kind } => {
                warn!(session_id = %state.id, evicted = evicted_kind, "mailbox full, evicted oldest coalescible frame");
            }
            OfferOutcome::RejectSlowConsumer => {
                warn!(session_id = %state.id, "mailbox full with nothing evictable, closing as slow consumer");
                if let Some(hub) = hub {
                    hub.close(&state.id, CloseReason::SlowConsumer).await;
                }
            }
            OfferOutcome::MailboxClosed => {}
        }
    }
}

fn collab_event_body(event: CollabEvent) -> OutboundBody {
    match event {
        CollabEvent::Started { .. } => OutboundBody::Ack { id: String::new() },
        CollabEvent::ParticipantProgress { agent_id, partial, .. } => {
            OutboundBody::ParticipantProgress { agent_id, partial }
        }
        CollabEvent::ParticipantCompleted { output, .. } => OutboundBody::ParticipantCompleted {
            agent_id: output.agent_id,
            content: output.content,
        },
        CollabEvent::ResolutionChosen { policy, class, .. } => {
            OutboundBody::ResolutionChosen { policy, class }
        }
        CollabEvent::AwaitingHuman { .. } => OutboundBody::AwaitingHuman,
        CollabEvent::Finished { result, .. } => OutboundBody::CollabFinished {
            status: result.status,
            content: result.terminal_content,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::coordinator::AgentCoordinator;
    use crate::agent::queue::TaskQueue;
    use crate::agent::AgentPool;
    use crate::auth::{AllowAllAuthorizer, Decision};
    use crate::backend::router::ModelRouter;
    use crate::backend::BackendRegistry;
    use crate::collaboration::CollaborationEngine;
    use crate::metrics::NoopMetricsSink;
    use crate::resilience::breaker::BreakerRegistry;
    use crate::resilience::{RateLimiter, RateLimiterConfig};
    use crate::storage::InMemoryResultStore;
    use async_trait::async_trait;

    const TEST_DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

    struct DenyAllAuthorizer;

    #[async_trait]
    impl Authorizer for DenyAllAuthorizer {
        async fn authorize(&self, _principal: &str, _action: &str, _resource: Option<&str>) -> Decision {
            Decision::Deny
        }
    }

    fn setup(authorizer: Arc<dyn Authorizer>) -> SessionHub {
        setup_with_mailbox(authorizer, DEFAULT_MAILBOX_SIZE)
    }

    fn setup_with_mailbox(authorizer: Arc<dyn Authorizer>, mailbox_size: usize) -> SessionHub {
        let queue = Arc::new(TaskQueue::new(16));
        let pool = Arc::new(AgentPool::new());
        let registry = Arc::new(BackendRegistry::new());
        let breakers = Arc::new(BreakerRegistry::new(Default::default()));
        let router = Arc::new(ModelRouter::new(registry, Arc::new(NoopMetricsSink), 3, breakers));
        let store = Arc::new(InMemoryResultStore::new(4096));
        let coordinator = Arc::new(AgentCoordinator::new(
            Arc::clone(&queue),
            pool.clone(),
            router,
            store.clone(),
            Arc::new(NoopMetricsSink),
        ));
        let collaboration = Arc::new(CollaborationEngine::new(
            Arc::clone(&coordinator),
            pool,
            store,
            Arc::new(NoopMetricsSink),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig { capacity: 100, ..Default::default() }));
        SessionHub::new(
            coordinator,
            collaboration,
            authorizer,
            rate_limiter,
            Arc::new(NoopMetricsSink),
            mailbox_size,
            TEST_DEFAULT_DEADLINE,
            TEST_DEFAULT_DEADLINE,
        )
    }

    fn submit_task_envelope() -> Envelope {
        Envelope {
            v: 1,
            kind: "submit_task".to_string(),
            id: "corr-1".to_string(),
            ts: 0,
            body: serde_json::json!({ "kind": "chat", "payload": { "Chat": { "input": "hi" } } }),
        }
    }

    #[tokio::test]
    async fn open_assigns_a_fresh_id_and_mailbox_each_time() {
        let hub = setup(Arc::new(AllowAllAuthorizer));
        let (id_a, _rx_a) = hub.open("user-1");
        let (id_b, _rx_b) = hub.open("user-1");
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn submit_task_is_acked_and_queued() {
        let hub = setup(Arc::new(AllowAllAuthorizer));
        let (id, mut rx) = hub.open("user-1");
        hub.inbound(&id, submit_task_envelope()).await;

        let envelope = rx.recv().await.expect("ack envelope");
        assert_eq!(envelope.kind, "ack");
        assert_eq!(envelope.id, "corr-1");
    }

    #[tokio::test]
    async fn unauthorized_action_is_rejected_before_touching_the_queue() {
        let hub = setup(Arc::new(DenyAllAuthorizer));
        let (id, mut rx) = hub.open("user-1");
        hub.inbound(&id, submit_task_envelope()).await;

        let envelope = rx.recv().await.expect("error envelope");
        assert_eq!(envelope.kind, "error");
        assert_eq!(envelope.body["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn unsupported_protocol_version_closes_the_session() {
        let hub = setup(Arc::new(AllowAllAuthorizer));
        let (id, mut rx) = hub.open("user-1");
        let mut envelope = submit_task_envelope();
        envelope.v = 2;
        hub.inbound(&id, envelope).await;

        let error = rx.recv().await.expect("error envelope");
        assert_eq!(error.body["code"], "UNSUPPORTED_PROTOCOL");

        // The session was closed as a side effect; a further frame is a
        // silent no-op rather than a panic.
        hub.inbound(&id, submit_task_envelope()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_frame_type_reports_unknown_frame_without_closing() {
        let hub = setup(Arc::new(AllowAllAuthorizer));
        let (id, mut rx) = hub.open("user-1");
        let envelope = Envelope {
            v: 1,
            kind: "not_a_real_frame".to_string(),
            id: "corr-2".to_string(),
            ts: 0,
            body: serde_json::json!({}),
        };
        hub.inbound(&id, envelope).await;

        let error = rx.recv().await.expect("error envelope");
        assert_eq!(error.body["code"], "UNKNOWN_FRAME");

        // The session stays open: a follow-up well-formed frame still works.
        hub.inbound(&id, submit_task_envelope()).await;
        let ack = rx.recv().await.expect("ack envelope");
        assert_eq!(ack.kind, "ack");
    }

    #[tokio::test]
    async fn heartbeat_is_echoed_back() {
        let hub = setup(Arc::new(AllowAllAuthorizer));
        let (id, mut rx) = hub.open("user-1");
        let envelope = Envelope {
            v: 1,
            kind: "heartbeat".to_string(),
            id: "corr-3".to_string(),
            ts: 0,
            body: serde_json::json!({}),
        };
        hub.inbound(&id, envelope).await;

        let reply = rx.recv().await.expect("heartbeat envelope");
        assert_eq!(reply.kind, "heartbeat");
    }

    #[tokio::test]
    async fn slow_consumer_closes_session_when_mailbox_overflows_with_nothing_evictable() {
        let hub = setup_with_mailbox(Arc::new(AllowAllAuthorizer), 1);
        let (id, mut rx) = hub.open("user-1");

        // An `ack` reply fills the single mailbox slot; it's neither
        // evictable nor terminal, so it's left undrained on purpose.
        hub.inbound(&id, submit_task_envelope()).await;
        // Mailbox is now full: this heartbeat reply has nothing to evict
        // (the buffered frame is an `ack`), so the session closes with
        // SLOW_CONSUMER.
        let heartbeat = Envelope {
            v: 1,
            kind: "heartbeat".to_string(),
            id: "corr-2".to_string(),
            ts: 0,
            body: serde_json::json!({}),
        };
        hub.inbound(&id, heartbeat.clone()).await;

        let buffered = rx.recv().await.expect("the ack was still buffered");
        assert_eq!(buffered.kind, "ack");
        // Nothing else was ever sent: the mailbox was closed when the
        // session closed, so the channel drains to `None`.
        assert!(rx.recv().await.is_none());

        // The session no longer exists; further frames are a silent no-op.
        hub.inbound(&id, heartbeat).await;
    }

    #[tokio::test]
    async fn mailbox_overflow_evicts_the_oldest_participant_progress_first() {
        let hub = Arc::new(setup_with_mailbox(Arc::new(AllowAllAuthorizer), 2));
        let (id, mut rx) = hub.open("user-1");
        let state = hub.sessions.get(&id).unwrap().value().clone();

        hub.deliver(
            &state,
            OutboundBody::ParticipantProgress { agent_id: "a1".to_string(), partial: "p1".to_string() },
            "corr-0",
        )
        .await;
        hub.deliver(&state, OutboundBody::Heartbeat, "corr-1").await;

        // Mailbox full with one `participant_progress` and one `heartbeat`
        // buffered; the next offer evicts the progress frame, not the
        // heartbeat (spec drop order), and the session stays open.
        hub.deliver(
            &state,
            OutboundBody::ParticipantProgress { agent_id: "a1".to_string(), partial: "p2".to_string() },
            "corr-2",
        )
        .await;

        let first = rx.recv().await.expect("surviving heartbeat");
        assert_eq!(first.kind, "heartbeat");
        let second = rx.recv().await.expect("the newer participant_progress");
        assert_eq!(second.kind, "participant_progress");
        assert_eq!(second.body["partial"], "p2");

        assert!(hub.sessions.get(&id).is_some(), "session must stay open after an eviction");
    }

    #[tokio::test]
    async fn terminal_events_are_never_dropped_even_when_the_mailbox_is_full() {
        let hub = Arc::new(setup_with_mailbox(Arc::new(AllowAllAuthorizer), 1));
        let (id, mut rx) = hub.open("user-1");
        let state = hub.sessions.get(&id).unwrap().value().clone();

        // Fill the single mailbox slot with a non-evictable, non-terminal
        // frame so the terminal delivery below has nothing to evict either.
        hub.deliver(&state, OutboundBody::Ack { id: "t0".to_string() }, "corr-0").await;

        hub.deliver(
            &state,
            OutboundBody::TaskFailed { task_id: "t1".to_string(), reason: Some("boom".to_string()) },
            "corr-1",
        )
        .await;

        let first = rx.recv().await.expect("buffered ack");
        assert_eq!(first.kind, "ack");
        let second = rx.recv().await.expect("the terminal task_failed was not dropped");
        assert_eq!(second.kind, "task_failed");

        // A terminal delivery that finds nothing evictable grows the
        // mailbox past capacity rather than closing the session.
        assert!(hub.sessions.get(&id).is_some());
    }

    #[tokio::test]
    async fn close_cancels_still_queued_tasks() {
        let hub = setup(Arc::new(AllowAllAuthorizer));
        let (id, mut rx) = hub.open("user-1");
        hub.inbound(&id, submit_task_envelope()).await;
        let _ack = rx.recv().await.expect("ack envelope");

        hub.close(&id, CloseReason::ClientRequested).await;

        // A frame addressed to a closed session is silently ignored.
        hub.inbound(&id, submit_task_envelope()).await;
        assert!(rx.try_recv().is_err());
    }
}

fn error_code(err: &RuntimeError) -> String {
    match err {
        RuntimeError::QueueFull { .. } => "QUEUE_FULL",
        RuntimeError::NoAgent { .. } => "NO_AGENT",
        RuntimeError::NoBackendAvailable { .. } => "NO_BACKEND_AVAILABLE",
        RuntimeError::DeadlineExceeded => "DEADLINE_EXCEEDED",
        RuntimeError::Cancelled => "CANCELLED",
        RuntimeError::CircuitOpen { .. } => "CIRCUIT_OPEN",
        RuntimeError::RateLimited { .. } => "RATE_LIMITED",
        RuntimeError::Forbidden => "FORBIDDEN",
        RuntimeError::Duplicate { .. } => "DUPLICATE",
        RuntimeError::UnknownFrame { .. } => "UNKNOWN_FRAME",
        RuntimeError::UnsupportedProtocol { .. } => "UNSUPPORTED_PROTOCOL",
        RuntimeError::RequestTimeout => "REQUEST_TIMEOUT",
        RuntimeError::CapabilityUnsupported { .. } => "CAPABILITY_UNSUPPORTED",
        RuntimeError::Internal { .. } => "INTERNAL",
    }
    .to_string()
}
