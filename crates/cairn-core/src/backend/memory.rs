//! In-memory directory backend
//!
//! A process-local directory shared between client handles. Entries carry a
//! liveness timestamp and count as healthy while refreshed within the TTL.
//! Used for embedding a single-process cluster and as the reference adapter
//! in tests.

use super::{BackendFactory, Capabilities, DiscoveryBackend, SharedBackend};
use crate::error::BackendError;
use crate::model::{DiscoveredNode, MemberEntry};
use crate::settings::Settings;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A registered entry as stored in the directory
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub entry: MemberEntry,
    pub registered_at: Instant,
    pub last_alive: Instant,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    /// service name -> member id -> record
    services: BTreeMap<String, BTreeMap<String, MemoryRecord>>,
    unavailable: HashSet<String>,
}

/// Process-local directory shared by every [`MemoryBackend`] handle
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make queries for `service` fail until cleared
    pub async fn set_unavailable(&self, service: &str, unavailable: bool) {
        let mut inner = self.inner.write().await;
        if unavailable {
            inner.unavailable.insert(service.to_string());
        } else {
            inner.unavailable.remove(service);
        }
    }

    /// Snapshot of the records registered under `service`
    pub async fn records(&self, service: &str) -> Vec<MemoryRecord> {
        let inner = self.inner.read().await;
        inner
            .services
            .get(service)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert an entry directly, bypassing any client (seeding peers in tests)
    pub async fn insert(&self, service: &str, entry: MemberEntry) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.services.entry(service.to_string()).or_default().insert(
            entry.id(),
            MemoryRecord {
                entry,
                registered_at: now,
                last_alive: now,
            },
        );
    }
}

/// Client handle onto a [`MemoryDirectory`]
#[derive(Debug)]
pub struct MemoryBackend {
    directory: MemoryDirectory,
    service_names: Vec<String>,
    ttl: Duration,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(directory: MemoryDirectory, service_names: Vec<String>, ttl: Duration) -> Self {
        Self::with_generation(directory, service_names, ttl, 0)
    }

    fn with_generation(
        directory: MemoryDirectory,
        service_names: Vec<String>,
        ttl: Duration,
        generation: u64,
    ) -> Self {
        Self {
            directory,
            service_names,
            ttl,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of client handles created before this one by its factory
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            Err(BackendError::Unavailable("client closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn service_names(&self) -> &[String] {
        &self.service_names
    }

    async fn query_service(
        &self,
        service_name: &str,
        only_alive: bool,
    ) -> Result<Vec<DiscoveredNode>, BackendError> {
        self.ensure_open()?;
        let inner = self.directory.inner.read().await;
        if inner.unavailable.contains(service_name) {
            return Err(BackendError::Unavailable(format!(
                "service {service_name} unavailable"
            )));
        }

        let now = Instant::now();
        let nodes = inner
            .services
            .get(service_name)
            .into_iter()
            .flat_map(|members| members.values())
            .map(|record| {
                let healthy = now.duration_since(record.last_alive) <= self.ttl;
                DiscoveredNode::new(record.entry.address.clone(), healthy, service_name)
            })
            .filter(|node| node.healthy || !only_alive)
            .collect();
        Ok(nodes)
    }

    async fn register(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut inner = self.directory.inner.write().await;
        for service in &self.service_names {
            inner.services.entry(service.clone()).or_default().insert(
                entry.id(),
                MemoryRecord {
                    entry: entry.clone(),
                    registered_at: now,
                    last_alive: now,
                },
            );
        }
        debug!(member_id = %entry.id(), address = %entry.address, "Registered in memory directory");
        Ok(())
    }

    async fn deregister(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        self.ensure_open()?;
        let id = entry.id();
        let mut inner = self.directory.inner.write().await;
        for service in &self.service_names {
            if let Some(members) = inner.services.get_mut(service) {
                members.remove(&id);
            }
        }
        debug!(member_id = %id, "Deregistered from memory directory");
        Ok(())
    }

    async fn refresh_liveness(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        self.ensure_open()?;
        let now = Instant::now();
        let id = entry.id();
        let mut inner = self.directory.inner.write().await;
        for service in &self.service_names {
            let members = inner.services.entry(service.clone()).or_default();
            match members.get_mut(&id) {
                Some(record) => record.last_alive = now,
                None => {
                    // expired or never registered: upsert
                    members.insert(
                        id.clone(),
                        MemoryRecord {
                            entry: entry.clone(),
                            registered_at: now,
                            last_alive: now,
                        },
                    );
                }
            }
        }
        trace!(member_id = %id, "Marked alive in memory directory");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Creates [`MemoryBackend`] handles onto one shared directory
#[derive(Debug)]
pub struct MemoryFactory {
    directory: MemoryDirectory,
    service_names: Vec<String>,
    ttl: Duration,
    created: AtomicU64,
}

impl MemoryFactory {
    pub fn new(directory: MemoryDirectory, settings: &Settings) -> Self {
        Self {
            directory,
            service_names: settings.service_names().to_vec(),
            ttl: settings.service_check_ttl(),
            created: AtomicU64::new(0),
        }
    }

    /// Number of client handles created so far
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BackendFactory for MemoryFactory {
    async fn create(&self) -> Result<SharedBackend, BackendError> {
        let generation = self.created.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryBackend::with_generation(
            self.directory.clone(),
            self.service_names.clone(),
            self.ttl,
            generation,
        )))
    }
}
