//! Discovery Metrics
//!
//! Metrics recorded by the discovery service:
//! - `cairn_join_attempts_total` - counter of registration attempts by outcome
//! - `cairn_liveness_refresh_total` - counter of liveness refreshes by outcome
//! - `cairn_enumerations_total` - counter of enumeration rounds by outcome
//! - `cairn_enumeration_duration_seconds` - histogram of enumeration latency
//! - `cairn_discovered_nodes` - gauge of nodes in the last reported list, by
//!   namespace and member
//! - `cairn_backend_errors_total` - counter of backend errors by operation
//! - `cairn_client_restarts_total` - counter of backend client restarts
//! - `cairn_service_ready` - gauge, 1 while the service is ready, by namespace
//!   and member
//!
//! Gauges carry `namespace` and `member` labels so several services sharing one
//! recorder each report their own series.

use crate::error::Operation;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Register descriptions for all discovery metrics
pub fn describe_metrics() {
    describe_counter!(
        "cairn_join_attempts_total",
        "Total number of registration attempts during join"
    );
    describe_counter!(
        "cairn_liveness_refresh_total",
        "Total number of liveness refreshes"
    );
    describe_counter!(
        "cairn_enumerations_total",
        "Total number of node enumeration rounds"
    );
    describe_histogram!(
        "cairn_enumeration_duration_seconds",
        "Duration of node enumeration in seconds"
    );
    describe_gauge!(
        "cairn_discovered_nodes",
        "Number of nodes in the last reported node list"
    );
    describe_counter!(
        "cairn_backend_errors_total",
        "Total number of failed backend calls"
    );
    describe_counter!(
        "cairn_client_restarts_total",
        "Total number of backend client restarts"
    );
    describe_gauge!("cairn_service_ready", "1 while the discovery service is ready");
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

/// Record a registration attempt
pub fn record_join_attempt(ok: bool) {
    counter!("cairn_join_attempts_total", "outcome" => outcome(ok)).increment(1);
}

/// Record a liveness refresh
pub fn record_liveness_refresh(ok: bool) {
    counter!("cairn_liveness_refresh_total", "outcome" => outcome(ok)).increment(1);
}

/// Record an enumeration round and its duration
pub fn record_enumeration(ok: bool, duration: Duration) {
    counter!("cairn_enumerations_total", "outcome" => outcome(ok)).increment(1);
    histogram!("cairn_enumeration_duration_seconds").record(duration.as_secs_f64());
}

/// Update the discovered nodes gauge
pub fn set_discovered_nodes(namespace: &str, member: &str, count: usize) {
    gauge!(
        "cairn_discovered_nodes",
        "namespace" => namespace.to_string(),
        "member" => member.to_string()
    )
    .set(count as f64);
}

/// Record a failed backend call
pub fn record_backend_error(backend: &str, operation: Operation) {
    counter!(
        "cairn_backend_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record a backend client restart
pub fn record_client_restart(ok: bool) {
    counter!("cairn_client_restarts_total", "outcome" => outcome(ok)).increment(1);
}

/// Update the readiness gauge
pub fn set_ready(namespace: &str, member: &str, ready: bool) {
    gauge!(
        "cairn_service_ready",
        "namespace" => namespace.to_string(),
        "member" => member.to_string()
    )
    .set(if ready { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_metric_recording() {
        // No recorder installed; these should be no-ops
        describe_metrics();
        record_join_attempt(true);
        record_join_attempt(false);
        record_liveness_refresh(true);
        record_enumeration(true, Duration::from_millis(20));
        set_discovered_nodes("default", "10.0.0.1:2552", 3);
        record_backend_error("memory", Operation::Enumerate);
        record_client_restart(true);
        set_ready("default", "10.0.0.1:2552", true);
    }

    #[test]
    fn test_readiness_is_per_service() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            set_ready("prod", "10.0.0.1:2552", true);
            set_ready("staging", "10.0.0.1:2552", true);
            set_ready("staging", "10.0.0.1:2552", false);
            set_discovered_nodes("prod", "10.0.0.1:2552", 4);
        });

        let rendered = handle.render();
        let line = |namespace: &str| {
            rendered
                .lines()
                .find(|l| {
                    l.starts_with("cairn_service_ready{")
                        && l.contains(&format!("namespace=\"{namespace}\""))
                })
                .map(str::to_string)
        };

        assert!(line("prod").unwrap().ends_with(" 1"));
        assert!(line("staging").unwrap().ends_with(" 0"));
        assert!(rendered
            .lines()
            .any(|l| l.starts_with("cairn_discovered_nodes{") && l.contains("prod") && l.ends_with(" 4")));
    }
}
