//! Process-wide observability setup: log/trace subscriber and the
//! Prometheus recorder. Discovery events and metric names live in
//! `cairn_core::observability`.

pub mod metrics;
pub mod tracing;

pub use metrics::{init_metrics, MetricsState};
pub use tracing::{init_tracing, shutdown_tracing, LogFormat, TracingConfig};
