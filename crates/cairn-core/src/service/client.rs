//! Backend Client Slot
//!
//! Owns the current backend client handle. Every call holds a read guard for
//! its whole duration, so a restart (which needs the write guard) waits for
//! in-flight calls to finish against the old handle before swapping. The
//! retired handle is closed only after the swap.
//!
//! Each directory call is bounded by `call_timeout`; an expired call is
//! dropped, releasing its guard, and reported as `Unavailable`. A hung call
//! therefore delays a pending restart, and the reads queued behind it, by at
//! most one timeout.

use crate::backend::{BackendFactory, Capabilities, SharedBackend};
use crate::error::{BackendError, Operation};
use crate::model::{DiscoveredNode, MemberEntry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub struct ClientSlot {
    factory: Arc<dyn BackendFactory>,
    current: RwLock<SharedBackend>,
    /// Serializes restarts so two replacements are never built at once
    restart_lock: Mutex<()>,
    restarts: AtomicU64,
    call_timeout: Duration,
}

impl ClientSlot {
    /// Build the first client through `factory`
    pub async fn connect(
        factory: Arc<dyn BackendFactory>,
        call_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = factory.create().await?;
        debug!(backend = client.name(), "Backend client created");
        Ok(Self {
            factory,
            current: RwLock::new(client),
            restart_lock: Mutex::new(()),
            restarts: AtomicU64::new(0),
            call_timeout,
        })
    }

    async fn bounded<T, F>(&self, operation: Operation, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(operation = %operation, timeout = ?self.call_timeout, "Backend call timed out");
                Err(BackendError::Unavailable(format!(
                    "{operation} timed out after {:?}",
                    self.call_timeout
                )))
            }
        }
    }

    pub async fn backend_name(&self) -> String {
        self.current.read().await.name().to_string()
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.current.read().await.capabilities()
    }

    /// Number of completed restarts
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }

    pub async fn enumerate(&self, only_alive: bool) -> Result<Vec<DiscoveredNode>, BackendError> {
        let client = self.current.read().await;
        self.bounded(Operation::Enumerate, client.enumerate(only_alive)).await
    }

    pub async fn register(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        let client = self.current.read().await;
        self.bounded(Operation::Register, client.register(entry)).await
    }

    pub async fn deregister(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        let client = self.current.read().await;
        self.bounded(Operation::Deregister, client.deregister(entry)).await
    }

    pub async fn refresh_liveness(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        let client = self.current.read().await;
        self.bounded(Operation::RefreshLiveness, client.refresh_liveness(entry)).await
    }

    /// Replace the client with a freshly built one.
    ///
    /// The replacement is built before any lock is taken; if that fails the
    /// current client stays in place. Returns the total number of restarts.
    pub async fn restart(&self) -> Result<u64, BackendError> {
        let _restarting = self.restart_lock.lock().await;

        let replacement = self.factory.create().await?;
        let retired = {
            let mut current = self.current.write().await;
            std::mem::replace(&mut *current, replacement)
        };
        retired.close().await;

        Ok(self.restarts.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Close the current client
    pub async fn close(&self) {
        self.current.read().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DiscoveryBackend, MemoryBackend, MemoryDirectory};
    use crate::model::NodeAddress;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Factory that remembers every handle it built
    #[derive(Default)]
    struct TrackingFactory {
        directory: MemoryDirectory,
        built: StdMutex<Vec<Arc<MemoryBackend>>>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl BackendFactory for TrackingFactory {
        async fn create(&self) -> Result<SharedBackend, BackendError> {
            if self.fail_next.swap(false, Ordering::AcqRel) {
                return Err(BackendError::Unavailable("connect refused".to_string()));
            }
            let backend = Arc::new(MemoryBackend::new(
                self.directory.clone(),
                vec!["web".to_string()],
                Duration::from_secs(30),
            ));
            self.built.lock().unwrap().push(backend.clone());
            Ok(backend)
        }
    }

    #[tokio::test]
    async fn test_restart_closes_retired_client() {
        let factory = Arc::new(TrackingFactory::default());
        let slot = ClientSlot::connect(factory.clone(), Duration::from_secs(5)).await.unwrap();

        assert_eq!(slot.restart().await.unwrap(), 1);

        let built = factory.built.lock().unwrap().clone();
        assert_eq!(built.len(), 2);
        assert!(built[0].is_closed());
        assert!(!built[1].is_closed());
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_current_client() {
        let factory = Arc::new(TrackingFactory::default());
        let slot = ClientSlot::connect(factory.clone(), Duration::from_secs(5)).await.unwrap();
        factory.fail_next.store(true, Ordering::Release);

        assert!(slot.restart().await.is_err());
        assert_eq!(slot.restarts(), 0);

        let entry = MemberEntry::new(NodeAddress::new("10.0.0.1", 2552));
        slot.register(&entry).await.unwrap();
        assert_eq!(slot.enumerate(true).await.unwrap().len(), 1);
        assert!(!factory.built.lock().unwrap()[0].is_closed());
    }

    /// Backend whose liveness refresh never completes
    struct StalledBackend {
        services: Vec<String>,
    }

    #[async_trait]
    impl DiscoveryBackend for StalledBackend {
        fn name(&self) -> &str {
            "stalled"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::full()
        }

        fn service_names(&self) -> &[String] {
            &self.services
        }

        async fn query_service(
            &self,
            _service_name: &str,
            _only_alive: bool,
        ) -> Result<Vec<DiscoveredNode>, BackendError> {
            Ok(Vec::new())
        }

        async fn refresh_liveness(&self, _entry: &MemberEntry) -> Result<(), BackendError> {
            std::future::pending().await
        }
    }

    struct StalledFactory;

    #[async_trait]
    impl BackendFactory for StalledFactory {
        async fn create(&self) -> Result<SharedBackend, BackendError> {
            Ok(Arc::new(StalledBackend {
                services: vec!["web".to_string()],
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_and_unblocks_restart() {
        let slot = Arc::new(
            ClientSlot::connect(Arc::new(StalledFactory), Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let entry = MemberEntry::new(NodeAddress::new("10.0.0.1", 2552));

        let stuck = tokio::spawn({
            let slot = slot.clone();
            async move { slot.refresh_liveness(&entry).await }
        });
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        assert_eq!(slot.restart().await.unwrap(), 1);
        assert!(started.elapsed() <= Duration::from_secs(5));

        match stuck.await.unwrap() {
            Err(BackendError::Unavailable(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(slot.enumerate(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_calls_use_replacement_after_restart() {
        let factory = Arc::new(TrackingFactory::default());
        let slot = ClientSlot::connect(factory.clone(), Duration::from_secs(5)).await.unwrap();
        slot.restart().await.unwrap();

        let entry = MemberEntry::new(NodeAddress::new("10.0.0.1", 2552));
        // the retired handle is closed and would reject this call
        slot.register(&entry).await.unwrap();
        assert_eq!(slot.backend_name().await, "memory");
    }
}
