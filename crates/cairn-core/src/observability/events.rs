//! Structured Events
//!
//! Each discovery lifecycle event has a dedicated function so field names stay
//! consistent across backends.
//!
//! Event types:
//! - `member_joined` / `join_attempt_failed` / `join_failed`
//! - `nodes_refreshed`
//! - `liveness_lost` / `liveness_restored`
//! - `client_restarted` / `client_restart_failed`
//! - `member_left` / `deregister_failed`

use tracing::{error, info, warn};

/// Emit a member joined event
pub fn member_joined(member_id: &str, address: &str, backend: &str, attempts: u32) {
    info!(
        event_type = "member_joined",
        member_id = %member_id,
        address = %address,
        backend = %backend,
        attempts = attempts,
        "Member registered in directory"
    );
}

/// Emit a single failed registration attempt
pub fn join_attempt_failed(member_id: &str, attempt: u32, max_attempts: u32, error: &str) {
    warn!(
        event_type = "join_attempt_failed",
        member_id = %member_id,
        attempt = attempt,
        max_attempts = max_attempts,
        error = %error,
        "Registration attempt failed"
    );
}

/// Emit a join failed event once retries are exhausted
pub fn join_failed(member_id: &str, attempts: u32, error: &str) {
    error!(
        event_type = "join_failed",
        member_id = %member_id,
        attempts = attempts,
        error = %error,
        "Join failed, giving up"
    );
}

/// Emit a nodes refreshed event
pub fn nodes_refreshed(previous_count: Option<usize>, healthy_count: usize, total_count: usize) {
    info!(
        event_type = "nodes_refreshed",
        previous_count = ?previous_count,
        healthy_count = healthy_count,
        total_count = total_count,
        "Node list refreshed"
    );
}

/// Emit a liveness lost event
pub fn liveness_lost(member_id: &str, since_last_success_secs: u64) {
    error!(
        event_type = "liveness_lost",
        member_id = %member_id,
        since_last_success_secs = since_last_success_secs,
        "Liveness not refreshed within alive timeout"
    );
}

/// Emit a liveness restored event
pub fn liveness_restored(member_id: &str) {
    info!(
        event_type = "liveness_restored",
        member_id = %member_id,
        "Liveness refresh succeeded again"
    );
}

/// Emit a client restarted event
pub fn client_restarted(backend: &str, restarts: u64) {
    info!(
        event_type = "client_restarted",
        backend = %backend,
        restarts = restarts,
        "Backend client restarted"
    );
}

/// Emit a client restart failed event
pub fn client_restart_failed(backend: &str, error: &str) {
    warn!(
        event_type = "client_restart_failed",
        backend = %backend,
        error = %error,
        "Backend client restart failed, keeping current client"
    );
}

/// Emit a member left event
pub fn member_left(member_id: &str, address: &str) {
    info!(
        event_type = "member_left",
        member_id = %member_id,
        address = %address,
        "Member deregistered from directory"
    );
}

/// Emit a deregister failed event
pub fn deregister_failed(member_id: &str, error: &str) {
    warn!(
        event_type = "deregister_failed",
        member_id = %member_id,
        error = %error,
        "Deregistration failed, entry will expire via TTL"
    );
}
