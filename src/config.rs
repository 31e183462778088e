//! Single initialization struct for the runtime, per spec §6.6.
//!
//! There are no recognized environment variables at the core level; every
//! value arrives through this struct. Loading it from a file, environment,
//! or CLI flags is explicitly out of scope (spec §1) and left to the
//! embedding application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentSpec;
use crate::backend::BackendSpec;
use crate::resilience::breaker::BreakerConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;

/// Default priority band used by `submit_task` when the caller doesn't
/// specify one. `2` sits in the middle of the four bands (0=critical..3=low).
pub const DEFAULT_PRIORITY_BAND: u8 = 2;

/// Top-level configuration consumed at startup to build every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Declared backends, forming the initial Backend Registry.
    pub backends: Vec<BackendSpec>,

    /// Declared agents, forming the initial Agent Pool.
    pub agents: Vec<AgentSpec>,

    /// Priority band assigned to `submit_task` calls that omit one.
    pub default_priority_band: u8,

    /// Task Queue capacity per priority band.
    pub queue_capacity_per_band: usize,

    /// Session outbound mailbox capacity.
    pub session_mailbox_size: usize,

    /// Circuit breaker defaults, shared by every dependency unless
    /// overridden per-name.
    pub breaker_defaults: BreakerConfig,

    /// Rate limiter defaults, shared by every key unless overridden.
    pub rate_limit_defaults: RateLimiterConfig,

    /// Default deadline applied to a Task that doesn't set one.
    #[serde(with = "humantime_duration")]
    pub default_task_deadline: Duration,

    /// Default deadline applied to a CollaborationRequest that doesn't set
    /// one.
    #[serde(with = "humantime_duration")]
    pub default_collab_deadline: Duration,

    /// Health probe interval for the Model Router's background prober.
    #[serde(with = "humantime_duration")]
    pub health_probe_interval: Duration,

    /// Maximum total attempts (across distinct backends) the Model Router
    /// will make for a single `GenerationRequest`.
    pub router_max_attempts: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            agents: Vec::new(),
            default_priority_band: DEFAULT_PRIORITY_BAND,
            queue_capacity_per_band: 1024,
            session_mailbox_size: 256,
            breaker_defaults: BreakerConfig::default(),
            rate_limit_defaults: RateLimiterConfig::default(),
            default_task_deadline: Duration::from_secs(60),
            default_collab_deadline: Duration::from_secs(180),
            health_probe_interval: Duration::from_secs(30),
            router_max_attempts: 3,
        }
    }
}

impl RuntimeConfig {
    /// Validate the static invariants spec §3 requires at startup: at least
    /// one backend with capability `chat`, and every agent capability set
    /// non-empty with a unique id.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.backends
                .iter()
                .any(|b| b.capabilities.iter().any(|c| c == "chat")),
            "at least one backend with capability 'chat' must exist at startup"
        );

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            anyhow::ensure!(
                !agent.capabilities.is_empty(),
                "agent '{}' has an empty capability set",
                agent.id
            );
            anyhow::ensure!(
                seen.insert(agent.id.clone()),
                "duplicate agent id '{}'",
                agent.id
            );
        }
        Ok(())
    }
}

/// `serde_with`-style helper (hand-rolled, the teacher avoids pulling in an
/// extra crate for a single field shape) for (de)serializing a `Duration`
/// as whole seconds.
pub(crate) mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
