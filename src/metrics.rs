#![forbid(unsafe_code)]

use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::sync::OnceLock;
use std::time::Duration;

pub use crate::telemetry::{
    RouteOutcomeSnapshot, RuntimeCountersSnapshot, TransformationOutcomeSnapshot,
};

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn record_route_decision(&self, route: &str) {
        self.counters.record_route_decision(route);
    }

    pub fn record_route_no_match(&self, route: &str) {
        self.counters.record_route_no_match(route);
    }

    pub fn record_route_filtered(&self, route: &str) {
        self.counters.record_route_filtered(route);
    }

    pub fn route_snapshot(&self, route: &str) -> RouteOutcomeSnapshot {
        self.counters.route_snapshot(route)
    }

    pub fn record_transformation(&self, transformation: &str, success: bool, duration: Duration) {
        self.counters.record_transformation(transformation, success, duration);
    }

    pub fn record_delivery_success(&self) {
        self.counters.inc_delivery_success();
    }

    pub fn record_delivery_failure(&self) {
        self.counters.inc_delivery_failure();
    }

    pub fn record_dead_letter(&self) {
        self.counters.inc_dead_letter();
    }

    pub fn record_fatal_drop(&self) {
        self.counters.inc_fatal_drop();
    }

    pub fn record_circuit_short_circuit(&self) {
        self.counters.inc_circuit_short_circuit();
    }

    pub fn record_flow_started(&self) {
        self.counters.inc_flow_started();
    }

    pub fn record_flow_succeeded(&self) {
        self.counters.inc_flow_succeeded();
    }

    pub fn record_flow_failed(&self) {
        self.counters.inc_flow_failed();
    }

    pub fn record_flow_cancelled(&self) {
        self.counters.inc_flow_cancelled();
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
