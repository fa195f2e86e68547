//! Directory backends available to the server binary.
//!
//! `memory` is process-local and only useful for a single node or for
//! trying the server out.

pub mod dns;
pub mod etcd;

pub use dns::{DnsBackend, DnsFactory, DEFAULT_CLUSTER_DOMAIN};
pub use etcd::{EtcdBackend, EtcdFactory, KeySpace, MemberRecord};

use cairn_core::backend::{MemoryDirectory, MemoryFactory};
use cairn_core::{BackendFactory, Settings};
use clap::ValueEnum;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// etcd v3 with leased member keys
    Etcd,
    /// Kubernetes headless-service DNS (read-only)
    Dns,
    /// In-process directory
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Etcd => "etcd",
            BackendKind::Dns => "dns",
            BackendKind::Memory => "memory",
        })
    }
}

/// Options only some backends look at
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub cluster_domain: String,
    /// Port assigned to DNS-discovered nodes
    pub dns_port: u16,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            dns_port: 2552,
        }
    }
}

pub fn build_factory(
    kind: BackendKind,
    settings: Arc<Settings>,
    options: &BackendOptions,
) -> Arc<dyn BackendFactory> {
    match kind {
        BackendKind::Etcd => Arc::new(EtcdFactory::new(settings)),
        BackendKind::Dns => Arc::new(DnsFactory::new(
            settings,
            options.cluster_domain.clone(),
            options.dns_port,
        )),
        BackendKind::Memory => Arc::new(MemoryFactory::new(MemoryDirectory::new(), &settings)),
    }
}
