//! Prometheus Exporter
//!
//! Installs the global recorder behind the `metrics` facade; the discovery
//! metrics themselves are described by `cairn_core`. Adds:
//! - `cairn_build_info` - gauge fixed at 1, labelled with version and commit

use crate::version;
use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

impl MetricsState {
    /// Current metrics in Prometheus exposition format
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Install the Prometheus recorder. Fails if a recorder is already installed.
pub fn init_metrics() -> anyhow::Result<MetricsState> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    cairn_core::observability::metrics::describe_metrics();
    describe_gauge!("cairn_build_info", "Build information, value is always 1");
    gauge!(
        "cairn_build_info",
        "version" => version::VERSION,
        "commit" => version::GIT_SHA
    )
    .set(1.0);

    Ok(MetricsState {
        prometheus_handle: handle,
    })
}
