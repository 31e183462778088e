//! Write-only metrics sink (C4), per spec §6.5.
//!
//! The runtime only ever writes metrics; collection and export are an
//! external concern. A `NoopMetricsSink` is the default so every component
//! works without a collector wired in.

use std::collections::BTreeMap;

/// A single label set, kept ordered so tests can assert on string output.
pub type Labels = BTreeMap<&'static str, String>;

/// Build a `Labels` map from `(key, value)` pairs.
#[macro_export]
macro_rules! labels {
    ($($k:expr => $v:expr),* $(,)?) => {{
        let mut m = $crate::metrics::Labels::new();
        $(m.insert($k, $v.to_string());)*
        m
    }};
}

/// The metric families the core emits, per spec §6.5.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &Labels, value: u64);
    fn set_gauge(&self, name: &str, labels: &Labels, value: f64);
    fn observe_histogram(&self, name: &str, labels: &Labels, value_ms: f64);
}

/// Default sink: every write is discarded. Used wherever a caller does not
/// inject a real collector.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn incr_counter(&self, _name: &str, _labels: &Labels, _value: u64) {}
    fn set_gauge(&self, _name: &str, _labels: &Labels, _value: f64) {}
    fn observe_histogram(&self, _name: &str, _labels: &Labels, _value_ms: f64) {}
}

/// Convenience counters/gauges/histograms named in spec §6.5, so call sites
/// don't respell metric names.
pub mod names {
    pub const TASKS_SUBMITTED_TOTAL: &str = "tasks_submitted_total";
    pub const TASKS_COMPLETED_TOTAL: &str = "tasks_completed_total";
    pub const BACKEND_INVOCATIONS_TOTAL: &str = "backend_invocations_total";
    pub const COLLAB_STARTED_TOTAL: &str = "collab_started_total";
    pub const SESSIONS_OPENED_TOTAL: &str = "sessions_opened_total";

    pub const AGENT_IN_FLIGHT: &str = "agent_in_flight";
    pub const BACKEND_IN_FLIGHT: &str = "backend_in_flight";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const OPEN_SESSIONS: &str = "open_sessions";

    pub const TASK_LATENCY_MS: &str = "task_latency_ms";
    pub const BACKEND_LATENCY_MS: &str = "backend_latency_ms";
    pub const COLLAB_LATENCY_MS: &str = "collab_latency_ms";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_never_panics() {
        let sink = NoopMetricsSink;
        let labels = labels! { "agent" => "backend-dev", "kind" => "code_analyze" };
        sink.incr_counter(names::TASKS_SUBMITTED_TOTAL, &labels, 1);
        sink.set_gauge(names::AGENT_IN_FLIGHT, &labels, 2.0);
        sink.observe_histogram(names::TASK_LATENCY_MS, &labels, 12.5);
    }
}
