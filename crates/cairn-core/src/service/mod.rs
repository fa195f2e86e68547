//! Discovery Service
//!
//! Drives one backend through its lifecycle:
//! 1. Starting: build the client, check capabilities, register self with retries
//! 2. Ready: alive, refresh and (optional) client-restart timers run as
//!    independent tasks
//! 3. Stopping: cancel timers, drain in-flight work, deregister self
//! 4. Stopped

mod client;
mod controller;
mod tasks;

pub use client::ClientSlot;
pub use controller::{DiscoveryHandle, DiscoveryService, DiscoveryStatus};

use crate::model::{DiscoveredNode, NodeAddress};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a discovery service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Building the client and registering self
    Starting,
    /// Registered; timers running
    Ready,
    /// Timers cancelled, deregistration in progress
    Stopping,
    /// Terminal
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications pushed to the host runtime
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Join sequence succeeded
    Joined { address: NodeAddress, attempts: u32 },
    /// Join sequence exhausted its attempts
    JoinFailed { attempts: u32, error: String },
    /// Result of a refresh tick (alive nodes only)
    NodesRefreshed(Vec<DiscoveredNode>),
    /// The backend client was replaced
    ClientRestarted { restarts: u64 },
    /// No liveness refresh succeeded within the alive timeout
    LivenessLost { since_last_success: Duration },
    /// A liveness refresh succeeded after `LivenessLost`
    LivenessRestored,
    /// Deregistration during shutdown failed; the entry expires via TTL
    DeregisterFailed { error: String },
    /// Shutdown finished
    Stopped,
}
