//! GET /nodes
//!
//! Serves the node list from the most recent refresh tick; never queries the
//! directory itself.

use super::AppState;
use axum::{extract::State, http::StatusCode, Json};
use cairn_core::{DiscoveredNode, NodeAddress};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub state: String,
    pub backend: String,
    pub self_address: NodeAddress,
    /// False until the first refresh tick has succeeded
    pub refreshed: bool,
    pub nodes: Vec<DiscoveredNode>,
}

#[tracing::instrument(skip(state))]
pub async fn get_nodes(State(state): State<AppState>) -> (StatusCode, Json<NodesResponse>) {
    let latest = state.status.last_nodes().await;
    let code = if latest.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = NodesResponse {
        state: state.status.state().to_string(),
        backend: state.backend.clone(),
        self_address: state.self_address.clone(),
        refreshed: latest.is_some(),
        nodes: latest.unwrap_or_default(),
    };
    (code, Json(response))
}
