//! Cairn Core
//!
//! Pluggable cluster discovery: a node registers itself in an external
//! directory, keeps its entry alive, and periodically enumerates its peers.
//!
//! - `settings`: validated, immutable configuration
//! - `model`: addresses, the local member entry and discovered nodes
//! - `backend`: the directory capability contract and the in-memory backend
//! - `service`: the discovery state machine driving a backend
//! - `observability`: structured events and metrics

pub mod backend;
pub mod error;
pub mod model;
pub mod observability;
pub mod service;
pub mod settings;

pub use backend::{BackendFactory, Capabilities, DiscoveryBackend, SharedBackend};
pub use error::{BackendError, ConfigError, DiscoveryError, Operation};
pub use model::{DiscoveredNode, MemberEntry, NodeAddress};
pub use service::{DiscoveryEvent, DiscoveryHandle, DiscoveryService, DiscoveryStatus, ServiceState};
pub use settings::{Settings, SettingsBuilder};
