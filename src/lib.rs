//! Cost-optimizing multi-agent orchestration runtime: a Model Router picks
//! the cheapest healthy backend for a capability, an Agent Coordinator
//! dispatches prioritized tasks onto a fixed agent pool, a Collaboration
//! Engine reconciles multi-agent sessions, and a Session Hub exposes it
//! all over a framed duplex transport. See each module for its piece.

pub mod agent;
pub mod auth;
pub mod backend;
pub mod collaboration;
pub mod config;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod secrets;
pub mod session;
pub mod storage;

pub use config::RuntimeConfig;
pub use error::{ResultExt, RuntimeError};

use std::sync::Arc;

use crate::agent::coordinator::AgentCoordinator;
use crate::agent::queue::TaskQueue;
use crate::agent::AgentPool;
use crate::auth::Authorizer;
use crate::backend::router::ModelRouter;
use crate::backend::BackendRegistry;
use crate::collaboration::CollaborationEngine;
use crate::metrics::MetricsSink;
use crate::resilience::{BreakerRegistry, RateLimiter};
use crate::session::SessionHub;
use crate::storage::{InMemoryResultStore, ResultStore};

/// Every component wired together from a `RuntimeConfig`, ready to accept
/// sessions once `spawn_background_tasks` has been called.
pub struct Runtime {
    pub backends: Arc<BackendRegistry>,
    pub agents: Arc<AgentPool>,
    pub router: Arc<ModelRouter>,
    pub queue: Arc<TaskQueue>,
    pub coordinator: Arc<AgentCoordinator>,
    pub collaboration: Arc<CollaborationEngine>,
    pub breakers: Arc<BreakerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub store: Arc<dyn ResultStore>,
    pub sessions: Arc<SessionHub>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Build every component from `config`, registering `backends` and
    /// `agents` handlers against the declarations in `config.backends` /
    /// `config.agents` in list order. Returns an error if `config` fails
    /// `RuntimeConfig::validate`.
    pub fn build(
        config: RuntimeConfig,
        backend_handlers: Vec<Arc<dyn backend::Backend>>,
        agent_handlers: Vec<Arc<dyn agent::Agent>>,
        authorizer: Arc<dyn Authorizer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            backend_handlers.len() == config.backends.len(),
            "expected one handler per declared backend"
        );
        anyhow::ensure!(
            agent_handlers.len() == config.agents.len(),
            "expected one handler per declared agent"
        );

        let backends = Arc::new(BackendRegistry::new());
        for (spec, handler) in config.backends.iter().cloned().zip(backend_handlers) {
            backends.register(spec, handler);
        }

        let agents = Arc::new(AgentPool::new());
        for (spec, handler) in config.agents.iter().cloned().zip(agent_handlers) {
            agents.register(spec, handler);
        }

        let breakers = Arc::new(BreakerRegistry::new(config.breaker_defaults.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_defaults.clone()));

        let router = Arc::new(ModelRouter::new(
            Arc::clone(&backends),
            Arc::clone(&metrics),
            config.router_max_attempts,
            Arc::clone(&breakers),
        ));
        let queue = Arc::new(TaskQueue::new(config.queue_capacity_per_band));
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new(storage::DEFAULT_CAPACITY));

        let coordinator = Arc::new(AgentCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&agents),
            Arc::clone(&router),
            Arc::clone(&store),
            Arc::clone(&metrics),
        ));

        let collaboration = Arc::new(CollaborationEngine::new(
            Arc::clone(&coordinator),
            Arc::clone(&agents),
            Arc::clone(&store),
            Arc::clone(&metrics),
        ));

        let sessions = Arc::new(SessionHub::new(
            Arc::clone(&coordinator),
            Arc::clone(&collaboration),
            authorizer,
            Arc::clone(&rate_limiter),
            Arc::clone(&metrics),
            config.session_mailbox_size,
            config.default_task_deadline,
            config.default_collab_deadline,
        ));

        Ok(Self {
            backends,
            agents,
            router,
            queue,
            coordinator,
            collaboration,
            breakers,
            rate_limiter,
            store,
            sessions,
            config,
        })
    }

    /// Spawn the long-lived background tasks: the Coordinator's dispatch
    /// loop and the Model Router's health prober (spec §5).
    pub fn spawn_background_tasks(&self) -> RuntimeHandles {
        let coordinator_handle = tokio::spawn({
            let coordinator = Arc::clone(&self.coordinator);
            async move { coordinator.run().await }
        });
        let prober_handle = Arc::clone(&self.router).spawn_prober(self.config.health_probe_interval);

        RuntimeHandles {
            coordinator: coordinator_handle,
            prober: prober_handle,
        }
    }
}

/// Join handles for the background tasks spawned by
/// `Runtime::spawn_background_tasks`.
pub struct RuntimeHandles {
    pub coordinator: tokio::task::JoinHandle<()>,
    pub prober: tokio::task::JoinHandle<()>,
}
