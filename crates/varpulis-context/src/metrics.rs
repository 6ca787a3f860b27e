//! Prometheus metrics for nested contexts

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Partition and agent-instance counters, labelled by context name
#[derive(Clone)]
pub struct ContextMetrics {
    registry: Arc<Registry>,
    pub partitions_created: IntCounterVec,
    pub partitions_terminated: IntCounterVec,
    pub active_partitions: IntGaugeVec,
    pub agent_instances_started: IntCounterVec,
    pub agent_instances_stopped: IntCounterVec,
    pub stop_failures: IntCounterVec,
}

impl ContextMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let partitions_created = IntCounterVec::new(
            Opts::new(
                "varpulis_context_partitions_created_total",
                "Leaf partitions started",
            ),
            &["context"],
        )
        .expect("failed to create partitions_created counter");

        let partitions_terminated = IntCounterVec::new(
            Opts::new(
                "varpulis_context_partitions_terminated_total",
                "Leaf partitions ended",
            ),
            &["context"],
        )
        .expect("failed to create partitions_terminated counter");

        let active_partitions = IntGaugeVec::new(
            Opts::new("varpulis_context_active_partitions", "Live leaf partitions"),
            &["context"],
        )
        .expect("failed to create active_partitions gauge");

        let agent_instances_started = IntCounterVec::new(
            Opts::new(
                "varpulis_context_agent_instances_started_total",
                "Statement instances started inside partitions",
            ),
            &["context"],
        )
        .expect("failed to create agent_instances_started counter");

        let agent_instances_stopped = IntCounterVec::new(
            Opts::new(
                "varpulis_context_agent_instances_stopped_total",
                "Statement instances stopped cleanly",
            ),
            &["context"],
        )
        .expect("failed to create agent_instances_stopped counter");

        let stop_failures = IntCounterVec::new(
            Opts::new(
                "varpulis_context_stop_failures_total",
                "Statement instances whose stop failed",
            ),
            &["context"],
        )
        .expect("failed to create stop_failures counter");

        registry
            .register(Box::new(partitions_created.clone()))
            .expect("failed to register partitions_created");
        registry
            .register(Box::new(partitions_terminated.clone()))
            .expect("failed to register partitions_terminated");
        registry
            .register(Box::new(active_partitions.clone()))
            .expect("failed to register active_partitions");
        registry
            .register(Box::new(agent_instances_started.clone()))
            .expect("failed to register agent_instances_started");
        registry
            .register(Box::new(agent_instances_stopped.clone()))
            .expect("failed to register agent_instances_stopped");
        registry
            .register(Box::new(stop_failures.clone()))
            .expect("failed to register stop_failures");

        Self {
            registry: Arc::new(registry),
            partitions_created,
            partitions_terminated,
            active_partitions,
            agent_instances_started,
            agent_instances_stopped,
            stop_failures,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ContextMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = ContextMetrics::new();
        metrics.partitions_created.with_label_values(&["ctx"]).inc();
        metrics.active_partitions.with_label_values(&["ctx"]).set(3);

        let text = metrics.gather_text();
        assert!(text.contains("varpulis_context_partitions_created_total{context=\"ctx\"} 1"));
        assert!(text.contains("varpulis_context_active_partitions{context=\"ctx\"} 3"));
    }
}
