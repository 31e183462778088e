//! Backend Registry (C5): catalog of inference backends with declared
//! capabilities, unit cost, and health, per spec §3.

pub mod router;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// LOCAL backends are free; REMOTE backends carry a per-1K-token cost
/// (spec §3 invariant: `tier=LOCAL ⇒ unit_cost=0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Degraded,
    Down,
}

/// Static declaration of a backend, as it would arrive via `RuntimeConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: String,
    pub tier: Tier,
    pub capabilities: Vec<String>,
    pub unit_cost: f64,
    pub max_concurrent: usize,
    pub priority: i32,
}

impl BackendSpec {
    pub fn local(id: impl Into<String>, capabilities: Vec<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            tier: Tier::Local,
            capabilities,
            unit_cost: 0.0,
            max_concurrent: 8,
            priority,
        }
    }

    pub fn remote(
        id: impl Into<String>,
        capabilities: Vec<String>,
        unit_cost: f64,
        priority: i32,
    ) -> Self {
        Self {
            id: id.into(),
            tier: Tier::Remote,
            capabilities,
            unit_cost,
            max_concurrent: 32,
            priority,
        }
    }
}

/// A request to generate output from some backend capability.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub capability: String,
    pub input: String,
    pub max_tokens: u32,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
}

/// A successful invocation result.
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub finish_reason: String,
}

/// Distinguishes transient failures (penalize health) from permanent ones
/// (capability mismatch, bad request) so the router doesn't punish a
/// healthy backend for a caller mistake (spec §6.2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("permanent backend failure: {0}")]
    Permanent(String),
    #[error("backend invocation timed out")]
    Timeout,
    /// The router's circuit breaker for this backend is open; the handler
    /// was never invoked (spec §4.5).
    #[error("circuit open for backend '{0}'")]
    CircuitOpen(String),
}

impl BackendError {
    /// Transient and timeout failures count against a backend's health;
    /// permanent ones (bad request, capability mismatch) do not (spec
    /// §6.2). A circuit-open rejection never reaches the handler, so it
    /// doesn't penalize health either; the breaker already tracks it.
    pub fn penalizes_health(&self) -> bool {
        !matches!(self, BackendError::Permanent(_) | BackendError::CircuitOpen(_))
    }
}

/// The external inference backend contract consumed by the Model Router,
/// per spec §6.2. The backend implementation itself is out of scope.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, req: &InvokeRequest) -> Result<InvokeResponse, BackendError>;
    async fn probe(&self) -> Result<(), BackendError>;
}

/// Mutable runtime state for one backend, owned exclusively by the Backend
/// Registry / Model Router (spec §3 ownership summary).
pub struct BackendEntry {
    pub spec: BackendSpec,
    pub handler: std::sync::Arc<dyn Backend>,
    capability_set: HashSet<String>,
    health: std::sync::atomic::AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    in_flight: AtomicUsize,
}

fn health_to_u8(h: Health) -> u8 {
    match h {
        Health::Healthy => 0,
        Health::Degraded => 1,
        Health::Down => 2,
    }
}

fn health_from_u8(v: u8) -> Health {
    match v {
        0 => Health::Healthy,
        1 => Health::Degraded,
        _ => Health::Down,
    }
}

impl BackendEntry {
    fn new(spec: BackendSpec, handler: std::sync::Arc<dyn Backend>) -> Self {
        let capability_set = spec.capabilities.iter().cloned().collect();
        Self {
            spec,
            handler,
            capability_set,
            health: std::sync::atomic::AtomicU8::new(health_to_u8(Health::Healthy)),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn capabilities(&self) -> &HashSet<String> {
        &self.capability_set
    }

    pub fn health(&self) -> Health {
        health_from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Direct access for the router to bracket an in-flight invocation;
    /// kept separate from `try_reserve`-style gating since backends (unlike
    /// agents) don't reject over `max_concurrent` here, only report load for
    /// the sort key.
    pub(crate) fn in_flight_counter(&self) -> &AtomicUsize {
        &self.in_flight
    }

    pub(crate) fn record_invocation_success(&self) {
        self.record_success();
    }

    pub(crate) fn record_invocation_failure(&self) {
        self.record_failure();
    }

    fn set_health(&self, health: Health) {
        self.health.store(health_to_u8(health), Ordering::Relaxed);
    }

    /// Record a failed invocation. Per spec §4.1: DEGRADED after 3
    /// consecutive failures, DOWN after 5.
    fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= 5 {
            self.set_health(Health::Down);
        } else if failures >= 3 {
            self.set_health(Health::Degraded);
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.health() == Health::Degraded {
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            // Spec §4.1: a DEGRADED backend returns to HEALTHY after 2
            // successful probes. The same rule is applied to successful
            // invocations, since an invocation is at least as strong a
            // signal as a probe.
            if successes >= 2 {
                self.set_health(Health::Healthy);
                self.consecutive_successes.store(0, Ordering::Relaxed);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
        }
    }

    /// A DOWN backend becomes eligible again for a single probe after
    /// `cooldown` has elapsed (spec §4.1: "eligible again after 60s via
    /// HALF_OPEN"). The registry doesn't track a separate HALF_OPEN state
    /// for backends; re-probing is handled by the health prober, which
    /// simply retries DOWN backends on its normal interval.
    fn record_probe_success(&self) {
        match self.health() {
            Health::Down => {
                // A successful probe against a DOWN backend: give it one
                // more chance at DEGRADED rather than snapping straight to
                // HEALTHY, matching the "after 2 successful probes" rule.
                self.set_health(Health::Degraded);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.consecutive_successes.store(1, Ordering::Relaxed);
            }
            Health::Degraded => self.record_success(),
            Health::Healthy => {}
        }
    }

    fn record_probe_failure(&self) {
        self.set_health(Health::Down);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }
}

/// Catalog of declared backends (spec §2, C5). Backends are created at
/// startup; health is mutated only by the Model Router.
pub struct BackendRegistry {
    backends: DashMap<String, std::sync::Arc<BackendEntry>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    pub fn register(&self, spec: BackendSpec, handler: std::sync::Arc<dyn Backend>) {
        let id = spec.id.clone();
        self.backends.insert(id, std::sync::Arc::new(BackendEntry::new(spec, handler)));
    }

    pub fn get(&self, id: &str) -> Option<std::sync::Arc<BackendEntry>> {
        self.backends.get(id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<std::sync::Arc<BackendEntry>> {
        self.backends.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backends declaring `capability` and not DOWN.
    pub fn candidates_for(&self, capability: &str) -> Vec<std::sync::Arc<BackendEntry>> {
        self.backends
            .iter()
            .map(|e| e.value().clone())
            .filter(|b| b.capabilities().contains(capability) && b.health() != Health::Down)
            .collect()
    }

    /// Backends eligible for a health probe: anything not currently
    /// HEALTHY, plus DOWN backends whose cooldown has elapsed. The caller
    /// supplies the cooldown so the registry stays free of wall-clock
    /// bookkeeping beyond what `Instant`-free health state already holds;
    /// in this crate the prober simply probes every non-healthy backend on
    /// its fixed interval, which subsumes the cooldown (spec §4.1: "DOWN
    /// backend is eligible again after 60s via HALF_OPEN", satisfied as
    /// long as the probe interval is <= the cooldown).
    pub fn probe_candidates(&self) -> Vec<std::sync::Arc<BackendEntry>> {
        self.backends
            .iter()
            .map(|e| e.value().clone())
            .filter(|b| b.health() != Health::Healthy)
            .collect()
    }
}

pub use router::ModelRouter;

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;

    #[async_trait]
    impl Backend for AlwaysOk {
        async fn invoke(&self, _req: &InvokeRequest) -> Result<InvokeResponse, BackendError> {
            Ok(InvokeResponse {
                content: "ok".into(),
                tokens_in: 1,
                tokens_out: 1,
                finish_reason: "stop".into(),
            })
        }

        async fn probe(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn health_escalates_with_consecutive_failures() {
        let entry = BackendEntry::new(
            BackendSpec::local("local-a", vec!["chat".into()], 1),
            std::sync::Arc::new(AlwaysOk),
        );
        assert_eq!(entry.health(), Health::Healthy);
        entry.record_failure();
        entry.record_failure();
        assert_eq!(entry.health(), Health::Healthy);
        entry.record_failure();
        assert_eq!(entry.health(), Health::Degraded);
        entry.record_failure();
        entry.record_failure();
        assert_eq!(entry.health(), Health::Down);
    }

    #[test]
    fn degraded_recovers_after_two_successes() {
        let entry = BackendEntry::new(
            BackendSpec::local("local-a", vec!["chat".into()], 1),
            std::sync::Arc::new(AlwaysOk),
        );
        entry.record_failure();
        entry.record_failure();
        entry.record_failure();
        assert_eq!(entry.health(), Health::Degraded);
        entry.record_success();
        assert_eq!(entry.health(), Health::Degraded);
        entry.record_success();
        assert_eq!(entry.health(), Health::Healthy);
    }

    #[test]
    fn registry_filters_down_backends_from_candidates() {
        let registry = BackendRegistry::new();
        registry.register(
            BackendSpec::local("local-a", vec!["chat".into()], 1),
            std::sync::Arc::new(AlwaysOk),
        );
        let entry = registry.get("local-a").unwrap();
        for _ in 0..5 {
            entry.record_failure();
        }
        assert!(registry.candidates_for("chat").is_empty());
    }
}
