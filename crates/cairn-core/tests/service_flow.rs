//! Discovery service lifecycle driven through a scripted, call-recording backend.

use async_trait::async_trait;
use cairn_core::backend::{MemoryDirectory, MemoryFactory};
use cairn_core::{
    BackendError, BackendFactory, Capabilities, DiscoveredNode, DiscoveryBackend, DiscoveryError,
    DiscoveryEvent, DiscoveryService, MemberEntry, NodeAddress, Operation, ServiceState, Settings,
    SharedBackend,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Register(u64, NodeAddress),
    Refresh(u64, NodeAddress),
    Deregister(u64, NodeAddress),
    Query(u64, String),
}

/// Shared script controlling every handle built by a [`FakeFactory`]
#[derive(Default)]
struct Script {
    calls: Mutex<Vec<Call>>,
    /// Registration failures still to serve; `u32::MAX` fails forever
    register_failures: AtomicU32,
    refresh_fails: AtomicBool,
    deregister_fails: AtomicBool,
    /// Per-service answer: node count, or an error message
    answers: Mutex<HashMap<String, Result<usize, String>>>,
    hold_queries: AtomicBool,
    query_entered: Notify,
    query_release: Notify,
    hold_refresh: AtomicBool,
    /// Client construction never completes once set
    hold_create: AtomicBool,
    closed: Mutex<Vec<u64>>,
}

impl Script {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, service: &str, answer: Result<usize, &str>) {
        self.answers
            .lock()
            .unwrap()
            .insert(service.to_string(), answer.map_err(str::to_string));
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

struct FakeBackend {
    script: Arc<Script>,
    generation: u64,
    services: Vec<String>,
    capabilities: Capabilities,
}

#[async_trait]
impl DiscoveryBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn service_names(&self) -> &[String] {
        &self.services
    }

    async fn query_service(
        &self,
        service_name: &str,
        _only_alive: bool,
    ) -> Result<Vec<DiscoveredNode>, BackendError> {
        self.script
            .calls
            .lock()
            .unwrap()
            .push(Call::Query(self.generation, service_name.to_string()));

        if self.script.hold_queries.load(Ordering::Acquire) {
            self.script.query_entered.notify_one();
            self.script.query_release.notified().await;
        }

        let answer = self
            .script
            .answers
            .lock()
            .unwrap()
            .get(service_name)
            .cloned()
            .unwrap_or(Ok(0));
        match answer {
            Ok(count) => Ok((0..count)
                .map(|i| {
                    DiscoveredNode::new(
                        // the port encodes which client generation answered
                        NodeAddress::new(format!("{service_name}-{i}"), 2000 + self.generation as u16),
                        true,
                        service_name,
                    )
                })
                .collect()),
            Err(msg) => Err(BackendError::Unavailable(msg)),
        }
    }

    async fn register(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        self.script
            .calls
            .lock()
            .unwrap()
            .push(Call::Register(self.generation, entry.address.clone()));
        let remaining = self.script.register_failures.load(Ordering::Acquire);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.script.register_failures.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(BackendError::Unavailable("registry down".to_string()));
        }
        Ok(())
    }

    async fn deregister(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        self.script
            .calls
            .lock()
            .unwrap()
            .push(Call::Deregister(self.generation, entry.address.clone()));
        if self.script.deregister_fails.load(Ordering::Acquire) {
            return Err(BackendError::Rejected("permission denied".to_string()));
        }
        Ok(())
    }

    async fn refresh_liveness(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        self.script
            .calls
            .lock()
            .unwrap()
            .push(Call::Refresh(self.generation, entry.address.clone()));
        if self.script.hold_refresh.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        if self.script.refresh_fails.load(Ordering::Acquire) {
            return Err(BackendError::Unavailable("ttl check failed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.script.closed.lock().unwrap().push(self.generation);
    }
}

struct FakeFactory {
    script: Arc<Script>,
    services: Vec<String>,
    capabilities: Capabilities,
    created: AtomicU64,
}

#[async_trait]
impl BackendFactory for FakeFactory {
    async fn create(&self) -> Result<SharedBackend, BackendError> {
        let generation = self.created.fetch_add(1, Ordering::AcqRel);
        if self.script.hold_create.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        Ok(Arc::new(FakeBackend {
            script: self.script.clone(),
            generation,
            services: self.services.clone(),
            capabilities: self.capabilities,
        }))
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn self_address() -> NodeAddress {
    NodeAddress::new("10.0.0.1", 2552)
}

/// alive 10s, ttl 30s, timeout 60s, refresh 15s, 3 join attempts, 5s call timeout
fn settings(services: &[&str]) -> Settings {
    Settings::builder()
        .alive_interval(secs(10))
        .service_check_ttl(secs(30))
        .alive_timeout(secs(60))
        .refresh_interval(secs(15))
        .join_retries(3)
        .join_backoff(Duration::from_millis(100), secs(1))
        .shutdown_grace(secs(2))
        .call_timeout(secs(5))
        .service_names(services.iter().copied())
        .build()
        .unwrap()
}

fn fake(
    settings: &Settings,
    capabilities: Capabilities,
) -> (Arc<Script>, Arc<FakeFactory>) {
    let script = Arc::new(Script::default());
    let factory = Arc::new(FakeFactory {
        script: script.clone(),
        services: settings.service_names().to_vec(),
        capabilities,
        created: AtomicU64::new(0),
    });
    (script, factory)
}

async fn next_nodes(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> Vec<DiscoveredNode> {
    loop {
        match rx.recv().await.expect("event channel closed") {
            DiscoveryEvent::NodesRefreshed(nodes) => return nodes,
            DiscoveryEvent::Joined { .. } | DiscoveryEvent::ClientRestarted { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_partial_outage_then_recovery() {
    let settings = settings(&["web", "api"]);
    let (script, factory) = fake(&settings, Capabilities::full());
    script.answer("web", Ok(2));
    script.answer("api", Err("throttled"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        DiscoveryEvent::Joined { address, attempts } => {
            assert_eq!(address, self_address());
            assert_eq!(attempts, 1);
        }
        other => panic!("expected Joined, got {other:?}"),
    }

    let first = next_nodes(&mut rx).await;
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|n| n.service == "web"));
    assert_eq!(handle.state(), ServiceState::Ready);

    script.answer("api", Ok(1));
    let second = next_nodes(&mut rx).await;
    assert_eq!(second.len(), 3);
    assert_eq!(second.iter().filter(|n| n.service == "api").count(), 1);
    assert_eq!(handle.state(), ServiceState::Ready);
    assert_eq!(handle.last_nodes().await, Some(second));

    handle.stop().await;
    let mut rest = Vec::new();
    while let Ok(event) = rx.try_recv() {
        rest.push(event);
    }
    assert_eq!(rest.last(), Some(&DiscoveryEvent::Stopped));
    assert!(!rest
        .iter()
        .any(|e| matches!(e, DiscoveryEvent::JoinFailed { .. } | DiscoveryEvent::DeregisterFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_join_gives_up_after_exactly_join_retries() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::full());
    script.register_failures.store(u32::MAX, Ordering::Release);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = DiscoveryService::new(settings, factory, self_address());
    let state = service.subscribe_state();
    let result = service.start(tx).await;

    match result {
        Err(DiscoveryError::JoinFailed { attempts, .. }) => assert_eq!(attempts, 3),
        Err(other) => panic!("expected JoinFailed, got {other:?}"),
        Ok(_) => panic!("join unexpectedly succeeded"),
    }
    assert_eq!(script.count(|c| matches!(c, Call::Register(..))), 3);
    assert_eq!(*state.borrow(), ServiceState::Stopped);
    assert!(matches!(
        rx.recv().await,
        Some(DiscoveryEvent::JoinFailed { attempts: 3, .. })
    ));
    assert_eq!(*script.closed.lock().unwrap(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_join_succeeds_after_transient_failures() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::full());
    script.register_failures.store(2, Ordering::Release);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();

    assert!(matches!(
        rx.recv().await,
        Some(DiscoveryEvent::Joined { attempts: 3, .. })
    ));
    assert_eq!(script.count(|c| matches!(c, Call::Register(..))), 3);
    handle.stop().await;
}

#[tokio::test]
async fn test_read_only_backend_is_rejected_at_startup() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::read_only());

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await;

    match result {
        Err(DiscoveryError::CapabilityMissing { backend, operation }) => {
            assert_eq!(backend, "fake");
            assert_eq!(operation, Operation::Register);
        }
        Err(other) => panic!("expected CapabilityMissing, got {other:?}"),
        Ok(_) => panic!("read-only backend unexpectedly started"),
    }
    assert!(script.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_liveness_refresh_never_changes_identity() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::full());

    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();

    tokio::time::sleep(secs(55)).await;
    handle.stop().await;

    let calls = script.calls();
    let refreshes: Vec<&Call> = calls.iter().filter(|c| matches!(c, Call::Refresh(..))).collect();
    assert_eq!(refreshes.len(), 5);
    assert!(refreshes
        .iter()
        .all(|c| **c == Call::Refresh(0, self_address())));
    assert_eq!(script.count(|c| matches!(c, Call::Register(..))), 1);
    assert_eq!(script.count(|c| matches!(c, Call::Deregister(..))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_liveness_lost_and_restored() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::full());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();
    script.refresh_fails.store(true, Ordering::Release);

    let lost = loop {
        match rx.recv().await.unwrap() {
            DiscoveryEvent::LivenessLost { since_last_success } => break since_last_success,
            DiscoveryEvent::LivenessRestored => panic!("restored before lost"),
            _ => continue,
        }
    };
    assert!(lost > secs(60));
    assert_eq!(handle.state(), ServiceState::Ready);

    script.refresh_fails.store(false, Ordering::Release);
    loop {
        match rx.recv().await.unwrap() {
            DiscoveryEvent::LivenessRestored => break,
            DiscoveryEvent::LivenessLost { .. } => panic!("liveness lost reported twice"),
            _ => continue,
        }
    }
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_timer_replaces_client() {
    let settings = Settings::builder()
        .alive_interval(secs(10))
        .alive_timeout(secs(60))
        .refresh_interval(secs(15))
        .restart_interval(secs(100))
        .service_names(["web"])
        .build()
        .unwrap();
    let (script, factory) = fake(&settings, Capabilities::full());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory.clone(), self_address())
        .start(tx)
        .await
        .unwrap();

    let restarts = loop {
        if let DiscoveryEvent::ClientRestarted { restarts } = rx.recv().await.unwrap() {
            break restarts;
        }
    };
    assert_eq!(restarts, 1);
    assert_eq!(factory.created.load(Ordering::Acquire), 2);
    assert_eq!(*script.closed.lock().unwrap(), vec![0]);

    // later refreshes go through the replacement client
    tokio::time::sleep(secs(20)).await;
    assert!(script.calls().contains(&Call::Refresh(1, self_address())));
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_refresh_does_not_starve_enumeration_across_restarts() {
    let settings = Settings::builder()
        .alive_interval(secs(10))
        .service_check_ttl(secs(30))
        .alive_timeout(secs(60))
        .refresh_interval(secs(15))
        .restart_interval(secs(20))
        .call_timeout(secs(5))
        .service_names(["web"])
        .build()
        .unwrap();
    let (script, factory) = fake(&settings, Capabilities::full());
    script.answer("web", Ok(1));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();
    // every liveness refresh from here on hangs in the backend
    script.hold_refresh.store(true, Ordering::Release);

    tokio::time::sleep(secs(300)).await;

    let (mut refreshed, mut restarted) = (0, 0);
    while let Ok(event) = rx.try_recv() {
        match event {
            DiscoveryEvent::NodesRefreshed(_) => refreshed += 1,
            DiscoveryEvent::ClientRestarted { .. } => restarted += 1,
            _ => {}
        }
    }
    // 21 refresh ticks and 15 restart ticks are due; a queued restart may
    // push a tick back by one call timeout
    assert!(refreshed >= 15, "only {refreshed} node lists reported");
    assert!(restarted >= 10, "only {restarted} client restarts");
    assert!(script.count(|c| matches!(c, Call::Refresh(..))) >= 20);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_hung_restart_returns_within_grace() {
    let settings = Settings::builder()
        .alive_interval(secs(10))
        .alive_timeout(secs(60))
        .refresh_interval(secs(15))
        .restart_interval(secs(20))
        .shutdown_grace(secs(2))
        .service_names(["web"])
        .build()
        .unwrap();
    let (script, factory) = fake(&settings, Capabilities::full());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory.clone(), self_address())
        .start(tx)
        .await
        .unwrap();
    script.hold_create.store(true, Ordering::Release);

    // the restart due at 20s is stuck building its replacement client
    tokio::time::sleep(secs(21)).await;
    assert_eq!(factory.created.load(Ordering::Acquire), 2);

    let started = tokio::time::Instant::now();
    handle.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= secs(2));
    assert!(elapsed <= secs(3), "stop took {elapsed:?}");
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, DiscoveryEvent::ClientRestarted { .. }),
            "restart completed during shutdown"
        );
    }
    // the original client deregisters and is the only one closed
    assert_eq!(script.count(|c| matches!(c, Call::Deregister(0, _))), 1);
    assert_eq!(*script.closed.lock().unwrap(), vec![0]);

    tokio::time::sleep(secs(120)).await;
    assert_eq!(factory.created.load(Ordering::Acquire), 2);
}

#[tokio::test]
async fn test_restart_waits_for_in_flight_enumeration() {
    let settings = Settings::builder()
        .alive_interval(secs(100))
        .alive_timeout(secs(600))
        .refresh_interval(secs(600))
        .service_names(["web"])
        .build()
        .unwrap();
    let (script, factory) = fake(&settings, Capabilities::full());
    script.answer("web", Ok(2));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = Arc::new(
        DiscoveryService::new(settings, factory.clone(), self_address())
            .start(tx)
            .await
            .unwrap(),
    );
    // initial refresh tick runs unheld
    assert_eq!(next_nodes(&mut rx).await.len(), 2);

    script.hold_queries.store(true, Ordering::Release);
    let in_flight = tokio::spawn({
        let handle = handle.clone();
        async move { handle.nodes(true).await }
    });
    script.query_entered.notified().await;

    let restart = tokio::spawn({
        let handle = handle.clone();
        async move { handle.restart_client().await }
    });
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(!restart.is_finished());
    assert!(script.closed.lock().unwrap().is_empty());

    script.hold_queries.store(false, Ordering::Release);
    script.query_release.notify_one();

    let nodes = in_flight.await.unwrap().unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.address.port() == 2000));

    assert_eq!(restart.await.unwrap().unwrap(), 1);
    assert_eq!(*script.closed.lock().unwrap(), vec![0]);

    let after = handle.nodes(true).await.unwrap();
    assert!(after.iter().all(|n| n.address.port() == 2001));

    let handle = Arc::try_unwrap(handle).ok().expect("handle still shared");
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_survives_failed_deregistration() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::full());
    script.deregister_fails.store(true, Ordering::Release);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();
    let state = handle.subscribe_state();

    handle.stop().await;

    assert_eq!(*state.borrow(), ServiceState::Stopped);
    let mut saw_failure = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, DiscoveryEvent::DeregisterFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
    assert_eq!(*script.closed.lock().unwrap(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_stuck_work_after_grace() {
    let settings = settings(&["web"]);
    let (script, factory) = fake(&settings, Capabilities::full());

    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = DiscoveryService::new(settings, factory, self_address())
        .start(tx)
        .await
        .unwrap();
    script.hold_refresh.store(true, Ordering::Release);

    // first alive tick at 10s gets stuck in the backend
    tokio::time::sleep(secs(11)).await;
    assert_eq!(script.count(|c| matches!(c, Call::Refresh(..))), 1);

    let started = tokio::time::Instant::now();
    handle.stop().await;

    assert!(started.elapsed() >= secs(2));
    assert_eq!(script.count(|c| matches!(c, Call::Deregister(..))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_memory_backend_cluster_sees_both_members() {
    let settings = settings(&["web"]);
    let directory = MemoryDirectory::new();

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let a = DiscoveryService::new(
        settings.clone(),
        Arc::new(MemoryFactory::new(directory.clone(), &settings)),
        NodeAddress::new("10.0.0.1", 2552),
    )
    .start(tx_a)
    .await
    .unwrap();
    assert_eq!(next_nodes(&mut rx_a).await.len(), 1);

    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let b = DiscoveryService::new(
        settings.clone(),
        Arc::new(MemoryFactory::new(directory.clone(), &settings)),
        NodeAddress::new("10.0.0.2", 2552),
    )
    .start(tx_b)
    .await
    .unwrap();

    assert_eq!(next_nodes(&mut rx_a).await.len(), 2);

    b.stop().await;
    let all = a.nodes(false).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].address, NodeAddress::new("10.0.0.1", 2552));
    a.stop().await;
}
