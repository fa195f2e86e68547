//! HTTP API
//!
//! - `health`: liveness and readiness probes
//! - `nodes`: last discovered node list
//! - `metrics`: Prometheus exposition
//! - `version`: build metadata

mod health;
mod metrics;
mod nodes;
mod state;
mod version;

pub use nodes::NodesResponse;
pub use state::AppState;

use axum::{routing::get, Router};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/nodes", get(nodes::get_nodes))
        .route("/metrics", get(metrics::get_metrics))
        .route("/version", get(version::get_version))
        .with_state(state)
}
