//! Shared state handed to every API handler

use crate::observability::MetricsState;
use cairn_core::{DiscoveryStatus, NodeAddress};

#[derive(Clone)]
pub struct AppState {
    pub status: DiscoveryStatus,
    pub self_address: NodeAddress,
    pub backend: String,
    /// None when the Prometheus recorder could not be installed
    pub metrics_state: Option<MetricsState>,
}
