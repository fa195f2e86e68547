//! Backend Adapter Contract
//!
//! Every directory technology implements [`DiscoveryBackend`]: one per-service
//! query plus register / deregister / refresh-liveness of the local entry.
//! A [`BackendFactory`] builds fresh client handles, both at startup and when
//! the discovery service recycles its client.

mod memory;

pub use memory::{MemoryBackend, MemoryDirectory, MemoryFactory};

use crate::error::{BackendError, Operation};
use crate::model::{DiscoveredNode, MemberEntry};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to a backend client
pub type SharedBackend = Arc<dyn DiscoveryBackend>;

/// Which write operations a backend supports. Enumeration is always supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub register: bool,
    pub deregister: bool,
    pub refresh_liveness: bool,
}

impl Capabilities {
    /// Read-write backend supporting every operation
    pub const fn full() -> Self {
        Self {
            register: true,
            deregister: true,
            refresh_liveness: true,
        }
    }

    /// Read-only discovery source
    pub const fn read_only() -> Self {
        Self {
            register: false,
            deregister: false,
            refresh_liveness: false,
        }
    }

    /// First write operation this backend lacks, if any
    pub fn first_missing(&self) -> Option<Operation> {
        if !self.register {
            Some(Operation::Register)
        } else if !self.deregister {
            Some(Operation::Deregister)
        } else if !self.refresh_liveness {
            Some(Operation::RefreshLiveness)
        } else {
            None
        }
    }
}

/// Client of one external directory service
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Short backend name used in logs and errors
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Ordered service names queried by [`enumerate`](Self::enumerate)
    fn service_names(&self) -> &[String];

    /// Query the directory for the nodes of a single service
    async fn query_service(
        &self,
        service_name: &str,
        only_alive: bool,
    ) -> Result<Vec<DiscoveredNode>, BackendError>;

    /// Query every configured service concurrently and merge the results.
    ///
    /// A failing per-service query contributes no nodes and does not fail
    /// the call.
    async fn enumerate(&self, only_alive: bool) -> Result<Vec<DiscoveredNode>, BackendError> {
        Ok(fan_out(self, only_alive).await)
    }

    async fn register(&self, _entry: &MemberEntry) -> Result<(), BackendError> {
        Err(BackendError::not_supported(Operation::Register))
    }

    async fn deregister(&self, _entry: &MemberEntry) -> Result<(), BackendError> {
        Err(BackendError::not_supported(Operation::Deregister))
    }

    async fn refresh_liveness(&self, _entry: &MemberEntry) -> Result<(), BackendError> {
        Err(BackendError::not_supported(Operation::RefreshLiveness))
    }

    /// Release the underlying client. Called once when the handle is retired.
    async fn close(&self) {}
}

/// Builds backend client handles
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> Result<SharedBackend, BackendError>;
}

/// Run `query_service` for every configured service concurrently, treating
/// failed queries as empty.
pub async fn fan_out<B>(backend: &B, only_alive: bool) -> Vec<DiscoveredNode>
where
    B: DiscoveryBackend + ?Sized,
{
    let queries = backend.service_names().iter().map(|service| async move {
        match backend.query_service(service, only_alive).await {
            Ok(nodes) => {
                debug!(
                    backend = backend.name(),
                    service = %service,
                    node_count = nodes.len(),
                    "Service query completed"
                );
                nodes
            }
            Err(e) => {
                warn!(
                    backend = backend.name(),
                    service = %service,
                    error = %e,
                    "Service query failed, treating as empty"
                );
                crate::observability::metrics::record_backend_error(
                    backend.name(),
                    Operation::Enumerate,
                );
                Vec::new()
            }
        }
    });

    join_all(queries).await.into_iter().flatten().collect()
}
