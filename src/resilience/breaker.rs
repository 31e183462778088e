//! Circuit Breaker (C3): per-dependency failure isolation, per spec §4.5.
//!
//! CLOSED -> OPEN when the failure threshold or failure rate over a
//! rolling window trips; OPEN -> HALF_OPEN after a cooldown with a single
//! probe in flight; HALF_OPEN -> CLOSED after consecutive successes, or
//! back to OPEN on any failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

fn state_to_u8(s: BreakerState) -> u8 {
    match s {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    }
}

fn state_from_u8(v: u8) -> BreakerState {
    match v {
        0 => BreakerState::Closed,
        1 => BreakerState::Open,
        _ => BreakerState::HalfOpen,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window_size: usize,
    pub min_samples: usize,
    pub failure_rate_threshold: f64,
    #[serde(with = "crate::config::humantime_duration")]
    pub cooldown: Duration,
    pub half_open_required_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_size: 20,
            min_samples: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            half_open_required_successes: 2,
        }
    }
}

/// One dependency's breaker state, owned exclusively by the registry.
struct Breaker {
    state: AtomicU8,
    consecutive_failures: AtomicU8,
    half_open_successes: AtomicU8,
    half_open_probe_in_flight: AtomicBool,
    opened_at_millis: AtomicI64,
    window: Mutex<VecDeque<bool>>,
    config: BreakerConfig,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(state_to_u8(BreakerState::Closed)),
            consecutive_failures: AtomicU8::new(0),
            half_open_successes: AtomicU8::new(0),
            half_open_probe_in_flight: AtomicBool::new(false),
            opened_at_millis: AtomicI64::new(0),
            window: Mutex::new(VecDeque::with_capacity(config.window_size)),
            config,
        }
    }

    fn state(&self) -> BreakerState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn trip_open(&self) {
        self.state.store(state_to_u8(BreakerState::Open), Ordering::Release);
        self.opened_at_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.half_open_probe_in_flight.store(false, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
    }

    /// `true` if a call may proceed right now. Transitions OPEN to
    /// HALF_OPEN once the cooldown elapses, admitting exactly one probe.
    async fn allow(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => self
                .half_open_probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok(),
            BreakerState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::Relaxed);
                let elapsed = Utc::now().timestamp_millis() - opened_at;
                if elapsed >= self.config.cooldown.as_millis() as i64 {
                    self.state.store(state_to_u8(BreakerState::HalfOpen), Ordering::Release);
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    self.half_open_probe_in_flight.store(true, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record(&self, success: bool) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.half_open_probe_in_flight.store(false, Ordering::Relaxed);
                if success {
                    let successes = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                    if successes >= self.config.half_open_required_successes as u8 {
                        self.state.store(state_to_u8(BreakerState::Closed), Ordering::Release);
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                        let mut window = self.window.lock().await;
                        window.clear();
                    }
                } else {
                    self.trip_open();
                }
            }
            BreakerState::Closed => {
                let mut window = self.window.lock().await;
                if window.len() == self.config.window_size {
                    window.pop_front();
                }
                window.push_back(success);

                if success {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return;
                }

                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures as u32 >= self.config.failure_threshold {
                    drop(window);
                    self.trip_open();
                    return;
                }

                if window.len() >= self.config.min_samples {
                    let failed = window.iter().filter(|s| !**s).count();
                    let rate = failed as f64 / window.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        drop(window);
                        self.trip_open();
                    }
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Per-dependency circuit breakers, keyed by dependency name (spec §4.5:
/// backend id, or an arbitrary external dependency name).
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Breaker>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    fn entry(&self, dependency: &str) -> Arc<Breaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(self.default_config.clone())))
            .clone()
    }

    pub fn state_of(&self, dependency: &str) -> BreakerState {
        self.entry(dependency).state()
    }

    /// Returns `true` if a call against `dependency` may proceed. Callers
    /// that get `false` should surface `RuntimeError::CircuitOpen`.
    pub async fn allow(&self, dependency: &str) -> bool {
        self.entry(dependency).allow().await
    }

    pub async fn record_success(&self, dependency: &str) {
        self.entry(dependency).record(true).await;
    }

    pub async fn record_failure(&self, dependency: &str) {
        self.entry(dependency).record(false).await;
    }
}
