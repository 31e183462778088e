//! Model Router (C6): cost-optimizing, local-preferring dispatcher with
//! fallback and health tracking, per spec §4.1.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{Backend, BackendEntry, BackendError, BackendRegistry, InvokeRequest, Tier};
use crate::error::RuntimeError;
use crate::metrics::{names, MetricsSink};
use crate::resilience::breaker::BreakerRegistry;

/// A request to generate output from some capability, per spec §4.1.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub capability: String,
    pub input: String,
    pub max_tokens: u32,
    pub allow_remote: bool,
    /// Used both for cost attribution and as the tie-break hash key.
    pub session_id: Option<String>,
    pub deadline: Option<chrono::DateTime<Utc>>,
}

impl GenerationRequest {
    pub fn new(capability: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            input: input.into(),
            max_tokens: 1024,
            allow_remote: true,
            session_id: None,
            deadline: None,
        }
    }
}

/// Response from a successful generation, per spec §4.1.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub backend_id: String,
    pub cost: f64,
    pub attempts: u8,
}

/// The Model Router. Safe for concurrent callers; the sorted-candidate
/// list is snapshot-per-call, never held across an invocation (spec §4.1
/// concurrency model).
pub struct ModelRouter {
    registry: Arc<BackendRegistry>,
    metrics: Arc<dyn MetricsSink>,
    max_attempts: u8,
    breakers: Arc<BreakerRegistry>,
}

impl ModelRouter {
    pub fn new(
        registry: Arc<BackendRegistry>,
        metrics: Arc<dyn MetricsSink>,
        max_attempts: u8,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            registry,
            metrics,
            max_attempts,
            breakers,
        }
    }

    fn tie_break_hash(session_id: Option<&str>, backend_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        session_id.unwrap_or("").hash(&mut hasher);
        backend_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Sort key per spec §4.1 step 3, with a stable hash-based tie-break
    /// (step 5) as the final component.
    fn sort_key(entry: &Arc<BackendEntry>, session_id: Option<&str>) -> (i32, usize, ordered_float::NotNan, u64) {
        let cost = ordered_float::NotNan::new(entry.spec.unit_cost).unwrap_or(ordered_float::NotNan::new(0.0).unwrap());
        (
            entry.spec.priority,
            entry.in_flight(),
            cost,
            Self::tie_break_hash(session_id, &entry.spec.id),
        )
    }

    /// Build the ordered list of candidates to try, per spec §4.1 steps
    /// 1-4.
    fn candidate_order(&self, capability: &str, allow_remote: bool, session_id: Option<&str>) -> Vec<Arc<BackendEntry>> {
        let candidates = self.registry.candidates_for(capability);
        let mut locals: Vec<_> = candidates
            .iter()
            .filter(|b| b.spec.tier == Tier::Local)
            .cloned()
            .collect();
        let mut remotes: Vec<_> = if allow_remote {
            candidates
                .iter()
                .filter(|b| b.spec.tier == Tier::Remote)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        locals.sort_by_key(|b| Self::sort_key(b, session_id));
        remotes.sort_by_key(|b| Self::sort_key(b, session_id));

        let local_is_healthy_top = locals
            .first()
            .map(|b| b.health() == super::Health::Healthy)
            .unwrap_or(false);

        if local_is_healthy_top {
            locals.into_iter().chain(remotes).collect()
        } else {
            let mut merged: Vec<_> = locals.into_iter().chain(remotes).collect();
            merged.sort_by_key(|b| Self::sort_key(b, session_id));
            merged
        }
    }

    /// Dispatch a `GenerationRequest`, trying candidates in order with
    /// fallback on failure, per spec §4.1.
    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, RuntimeError> {
        let declared = self
            .registry
            .all()
            .iter()
            .any(|b| b.capabilities().contains(req.capability.as_str()));
        if !declared {
            return Err(RuntimeError::CapabilityUnsupported {
                capability: req.capability.clone(),
            });
        }

        let candidates = self.candidate_order(&req.capability, req.allow_remote, req.session_id.as_deref());
        if candidates.is_empty() {
            return Err(RuntimeError::NoBackendAvailable {
                capability: req.capability.clone(),
            });
        }

        let mut attempts: u8 = 0;
        let mut last_was_timeout = false;
        let mut last_circuit_open: Option<String> = None;
        let mut all_circuit_open = true;

        for candidate in candidates.into_iter().take(self.max_attempts as usize) {
            attempts += 1;
            let outcome = self.invoke_one(&candidate, req).await;
            let labels = crate::labels! {
                "backend" => candidate.spec.id.clone(),
                "status" => if outcome.is_ok() { "ok" } else { "error" },
            };
            self.metrics
                .incr_counter(names::BACKEND_INVOCATIONS_TOTAL, &labels, 1);

            match outcome {
                Ok(resp) => {
                    let cost = (resp.tokens_out as f64 / 1000.0) * candidate.spec.unit_cost;
                    info!(backend_id = %candidate.spec.id, attempts, "generation succeeded");
                    return Ok(GenerationResponse {
                        content: resp.content,
                        tokens_in: resp.tokens_in,
                        tokens_out: resp.tokens_out,
                        backend_id: candidate.spec.id.clone(),
                        cost,
                        attempts,
                    });
                }
                Err(BackendError::CircuitOpen(dependency)) => {
                    warn!(backend_id = %candidate.spec.id, "circuit open, skipping invocation");
                    last_circuit_open = Some(dependency);
                }
                Err(BackendError::Timeout) => {
                    all_circuit_open = false;
                    last_was_timeout = true;
                    warn!(backend_id = %candidate.spec.id, "invocation timed out");
                }
                Err(e) => {
                    all_circuit_open = false;
                    last_was_timeout = false;
                    warn!(backend_id = %candidate.spec.id, error = %e, "invocation failed");
                }
            }
        }

        if attempts > 0 && all_circuit_open {
            if let Some(dependency) = last_circuit_open {
                return Err(RuntimeError::CircuitOpen { dependency });
            }
        }

        if last_was_timeout {
            Err(RuntimeError::RequestTimeout)
        } else {
            Err(RuntimeError::NoBackendAvailable {
                capability: req.capability.clone(),
            })
        }
    }

    async fn invoke_one(
        &self,
        candidate: &Arc<BackendEntry>,
        req: &GenerationRequest,
    ) -> Result<super::InvokeResponse, BackendError> {
        if let Some(deadline) = req.deadline {
            if Utc::now() >= deadline {
                return Err(BackendError::Timeout);
            }
        }

        if !self.breakers.allow(&candidate.spec.id).await {
            return Err(BackendError::CircuitOpen(candidate.spec.id.clone()));
        }

        candidate
            .in_flight_counter()
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        let invoke_req = InvokeRequest {
            capability: req.capability.clone(),
            input: req.input.clone(),
            max_tokens: req.max_tokens,
            deadline: req.deadline,
        };

        let timeout_budget = req
            .deadline
            .and_then(|d| (d - Utc::now()).to_std().ok())
            .unwrap_or(StdDuration::from_secs(60));

        let result = tokio::time::timeout(timeout_budget, candidate.handler.invoke(&invoke_req)).await;

        candidate
            .in_flight_counter()
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);

        match result {
            Ok(Ok(resp)) => {
                candidate.record_invocation_success();
                self.breakers.record_success(&candidate.spec.id).await;
                Ok(resp)
            }
            Ok(Err(e)) => {
                if e.penalizes_health() {
                    candidate.record_invocation_failure();
                    self.breakers.record_failure(&candidate.spec.id).await;
                }
                Err(e)
            }
            Err(_elapsed) => {
                candidate.record_invocation_failure();
                self.breakers.record_failure(&candidate.spec.id).await;
                Err(BackendError::Timeout)
            }
        }
    }

    /// Spawn the background health prober (spec §4.1: "every 30s").
    /// Interval is jittered by up to 10% to avoid synchronized probing
    /// across many router instances in a process.
    pub fn spawn_prober(self: Arc<Self>, base_interval: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let jitter_frac = rand::rng().random_range(0.0..0.1);
                let sleep_for = base_interval.mul_f64(1.0 + jitter_frac);
                tokio::time::sleep(sleep_for).await;

                for backend in self.registry.probe_candidates() {
                    match backend.handler.probe().await {
                        Ok(()) => {
                            backend.record_probe_success();
                            debug!(backend_id = %backend.spec.id, health = ?backend.health(), "probe ok");
                        }
                        Err(_) => {
                            backend.record_probe_failure();
                            debug!(backend_id = %backend.spec.id, "probe failed");
                        }
                    }
                }
            }
        })
    }
}

/// Minimal wrapper around `ordered_float`-style comparisons without pulling
/// in the crate: unit costs are always finite, non-negative values, so a
/// thin newtype implementing `Ord` suffices for the sort key above.
mod ordered_float {
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct NotNan(f64);

    impl NotNan {
        pub fn new(v: f64) -> Option<Self> {
            if v.is_nan() {
                None
            } else {
                Some(Self(v))
            }
        }
    }

    impl Eq for NotNan {}

    impl PartialOrd for NotNan {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for NotNan {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}
