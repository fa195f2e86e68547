//! Liveness and readiness probes

use super::state::AppState;
use axum::{extract::State, http::StatusCode};
use cairn_core::ServiceState;

/// Alive until discovery begins shutting down
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    match state.status.state() {
        ServiceState::Starting | ServiceState::Ready => Ok("OK"),
        ServiceState::Stopping | ServiceState::Stopped => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Ready once the local entry is registered and timers are running
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.status.is_ready() {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
