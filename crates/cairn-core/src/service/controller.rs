//! Discovery Controller
//!
//! Orchestrates the join sequence, the ready-state timers and the leave
//! sequence for one backend.

use super::client::ClientSlot;
use super::tasks::{self, TaskContext};
use super::{DiscoveryEvent, ServiceState};
use crate::backend::BackendFactory;
use crate::error::{BackendError, DiscoveryError};
use crate::model::{DiscoveredNode, MemberEntry, NodeAddress};
use crate::observability::{events, metrics};
use crate::settings::Settings;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A discovery service that has not been started yet
pub struct DiscoveryService {
    settings: Arc<Settings>,
    factory: Arc<dyn BackendFactory>,
    entry: MemberEntry,
    state_tx: watch::Sender<ServiceState>,
}

impl DiscoveryService {
    pub fn new(
        settings: Settings,
        factory: Arc<dyn BackendFactory>,
        self_address: NodeAddress,
    ) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::Starting);
        Self {
            settings: Arc::new(settings),
            factory,
            entry: MemberEntry::new(self_address),
            state_tx,
        }
    }

    /// Attach metadata to the registered entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry = self.entry.with_metadata(key, value);
        self
    }

    pub fn entry(&self) -> &MemberEntry {
        &self.entry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Observe lifecycle state, including the `Starting` phase of `start`
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Run the join sequence and enter `Ready`.
    ///
    /// Blocks until the local entry is registered or registration has failed
    /// `join_retries` times. Node lists and other notifications are pushed to
    /// `events`.
    pub async fn start(
        self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<DiscoveryHandle, DiscoveryError> {
        let Self {
            settings,
            factory,
            entry,
            state_tx,
        } = self;

        state_tx.send_replace(ServiceState::Starting);
        info!(
            address = %entry.address,
            namespace = %settings.namespace(),
            services = ?settings.service_names(),
            "Discovery: starting"
        );

        let slot = match ClientSlot::connect(factory, settings.call_timeout()).await {
            Ok(slot) => Arc::new(slot),
            Err(e) => {
                warn!(error = %e, "Discovery: failed to create backend client");
                state_tx.send_replace(ServiceState::Stopped);
                return Err(DiscoveryError::Backend(e));
            }
        };

        let backend = slot.backend_name().await;
        if let Some(operation) = slot.capabilities().await.first_missing() {
            warn!(backend = %backend, operation = %operation, "Discovery: backend lacks a required operation");
            slot.close().await;
            state_tx.send_replace(ServiceState::Stopped);
            return Err(DiscoveryError::CapabilityMissing { backend, operation });
        }

        match join(&slot, &entry, &settings).await {
            Ok(attempts) => {
                events::member_joined(&entry.id(), &entry.address.to_string(), &backend, attempts);
                let _ = events.send(DiscoveryEvent::Joined {
                    address: entry.address.clone(),
                    attempts,
                });
            }
            Err(e) => {
                if let DiscoveryError::JoinFailed { attempts, source } = &e {
                    let _ = events.send(DiscoveryEvent::JoinFailed {
                        attempts: *attempts,
                        error: source.to_string(),
                    });
                }
                slot.close().await;
                state_tx.send_replace(ServiceState::Stopped);
                return Err(e);
            }
        }

        let ctx = Arc::new(TaskContext {
            settings: settings.clone(),
            slot,
            entry,
            events,
            latest: Arc::new(RwLock::new(None)),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut timers = vec![
            tasks::spawn_alive_task(ctx.clone(), shutdown_rx.clone()),
            tasks::spawn_refresh_task(ctx.clone(), shutdown_rx.clone()),
        ];
        if let Some(restart_interval) = settings.restart_interval() {
            timers.push(tasks::spawn_restart_task(
                ctx.clone(),
                restart_interval,
                shutdown_rx,
            ));
        }

        state_tx.send_replace(ServiceState::Ready);
        metrics::set_ready(settings.namespace(), &ctx.entry.address.to_string(), true);
        info!(backend = %backend, "Discovery: ready");

        Ok(DiscoveryHandle {
            ctx,
            state_tx,
            shutdown_tx,
            timers,
        })
    }
}

/// Register self, retrying with exponential backoff up to `join_retries`
/// attempts in total. Returns the number of attempts made.
async fn join(
    slot: &ClientSlot,
    entry: &MemberEntry,
    settings: &Settings,
) -> Result<u32, DiscoveryError> {
    let max_attempts = settings.join_retries();
    let mut backoff = ExponentialBackoff {
        initial_interval: settings.join_backoff_initial(),
        max_interval: settings.join_backoff_max(),
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();

    let mut attempt = 0;
    loop {
        attempt += 1;
        match slot.register(entry).await {
            Ok(()) => {
                metrics::record_join_attempt(true);
                return Ok(attempt);
            }
            Err(e) => {
                metrics::record_join_attempt(false);
                metrics::record_backend_error(
                    &slot.backend_name().await,
                    crate::error::Operation::Register,
                );

                if let BackendError::NotSupported { operation } = e {
                    return Err(DiscoveryError::CapabilityMissing {
                        backend: slot.backend_name().await,
                        operation,
                    });
                }
                if attempt >= max_attempts {
                    events::join_failed(&entry.id(), attempt, &e.to_string());
                    return Err(DiscoveryError::JoinFailed {
                        attempts: attempt,
                        source: e,
                    });
                }

                events::join_attempt_failed(&entry.id(), attempt, max_attempts, &e.to_string());
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| settings.join_backoff_max());
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Read-only view of a running service, cheap to clone into other tasks
#[derive(Clone)]
pub struct DiscoveryStatus {
    state: watch::Receiver<ServiceState>,
    latest: Arc<RwLock<Option<Vec<DiscoveredNode>>>>,
}

impl DiscoveryStatus {
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Node list from the last successful refresh tick
    pub async fn last_nodes(&self) -> Option<Vec<DiscoveredNode>> {
        self.latest.read().await.clone()
    }
}

/// Handle to a running discovery service
pub struct DiscoveryHandle {
    ctx: Arc<TaskContext>,
    state_tx: watch::Sender<ServiceState>,
    shutdown_tx: watch::Sender<bool>,
    timers: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> DiscoveryStatus {
        DiscoveryStatus {
            state: self.state_tx.subscribe(),
            latest: self.ctx.latest.clone(),
        }
    }

    pub fn entry(&self) -> &MemberEntry {
        &self.ctx.entry
    }

    /// Enumerate nodes on demand, outside the refresh timer.
    ///
    /// Pass `only_alive = false` to include nodes the directory reports as
    /// unhealthy.
    pub async fn nodes(&self, only_alive: bool) -> Result<Vec<DiscoveredNode>, DiscoveryError> {
        if self.state() != ServiceState::Ready {
            return Err(DiscoveryError::NotReady);
        }
        Ok(self.ctx.slot.enumerate(only_alive).await?)
    }

    /// Node list from the last successful refresh tick
    pub async fn last_nodes(&self) -> Option<Vec<DiscoveredNode>> {
        self.ctx.latest.read().await.clone()
    }

    /// Replace the backend client now, outside the restart timer.
    /// Returns the total number of restarts.
    pub async fn restart_client(&self) -> Result<u64, DiscoveryError> {
        if self.state() != ServiceState::Ready {
            return Err(DiscoveryError::NotReady);
        }
        tasks::restart_client(&self.ctx).await
    }

    /// Leave the cluster.
    ///
    /// Timers are cancelled first, in-flight work gets `shutdown_grace` to
    /// finish before being aborted, then deregistration is attempted once.
    /// A failed deregistration is logged and reported but never returned.
    pub async fn stop(self) {
        let Self {
            ctx,
            state_tx,
            shutdown_tx,
            timers,
        } = self;
        let grace = ctx.settings.shutdown_grace();

        state_tx.send_replace(ServiceState::Stopping);
        metrics::set_ready(ctx.settings.namespace(), &ctx.entry.address.to_string(), false);
        info!("Discovery: stopping");

        let _ = shutdown_tx.send(true);
        let deadline = Instant::now() + grace;
        for timer in timers {
            let abort = timer.abort_handle();
            if tokio::time::timeout_at(deadline, timer).await.is_err() {
                warn!("Discovery: in-flight timer work exceeded shutdown grace, aborting");
                abort.abort();
            }
        }

        let member_id = ctx.entry.id();
        match tokio::time::timeout(grace, ctx.slot.deregister(&ctx.entry)).await {
            Ok(Ok(())) => {
                events::member_left(&member_id, &ctx.entry.address.to_string());
            }
            Ok(Err(e)) => {
                events::deregister_failed(&member_id, &e.to_string());
                ctx.emit(DiscoveryEvent::DeregisterFailed {
                    error: e.to_string(),
                });
            }
            Err(_) => {
                events::deregister_failed(&member_id, "timed out");
                ctx.emit(DiscoveryEvent::DeregisterFailed {
                    error: "timed out".to_string(),
                });
            }
        }

        ctx.slot.close().await;
        state_tx.send_replace(ServiceState::Stopped);
        ctx.emit(DiscoveryEvent::Stopped);
        debug!("Discovery: stopped");
    }
}
