//! Timer Tasks
//!
//! Each timer runs in its own task so a slow directory call only delays its
//! own timer. Every loop exits when the shutdown signal flips or its sender is
//! dropped.

use super::client::ClientSlot;
use super::DiscoveryEvent;
use crate::error::{DiscoveryError, Operation};
use crate::model::{DiscoveredNode, MemberEntry};
use crate::observability::{events, metrics};
use crate::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// State shared by the timer tasks and the handle
pub(super) struct TaskContext {
    pub settings: Arc<Settings>,
    pub slot: Arc<ClientSlot>,
    pub entry: MemberEntry,
    pub events: mpsc::UnboundedSender<DiscoveryEvent>,
    pub latest: Arc<RwLock<Option<Vec<DiscoveredNode>>>>,
}

impl TaskContext {
    pub fn emit(&self, event: DiscoveryEvent) {
        if self.events.send(event).is_err() {
            trace!("Discovery event receiver dropped");
        }
    }
}

fn interval_after_first(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Wait for the next tick, or return `false` once shutdown is requested
async fn next_tick(interval: &mut tokio::time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        _ = interval.tick() => true,
    }
}

/// Marks the local entry alive every `alive_interval`.
///
/// Failures are logged and retried on the next tick. If nothing succeeds for
/// longer than `alive_timeout` the host is told once, and told again when a
/// refresh succeeds.
pub(super) fn spawn_alive_task(
    ctx: Arc<TaskContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let alive_timeout = ctx.settings.alive_timeout();
        // registration just happened, so the first refresh waits a full period
        let mut interval = interval_after_first(ctx.settings.alive_interval());
        let mut last_success = Instant::now();
        let mut lost = false;

        while next_tick(&mut interval, &mut shutdown).await {
            match ctx.slot.refresh_liveness(&ctx.entry).await {
                Ok(()) => {
                    metrics::record_liveness_refresh(true);
                    last_success = Instant::now();
                    trace!(member_id = %ctx.entry.id(), "Liveness refreshed");
                    if lost {
                        lost = false;
                        events::liveness_restored(&ctx.entry.id());
                        ctx.emit(DiscoveryEvent::LivenessRestored);
                    }
                }
                Err(e) => {
                    metrics::record_liveness_refresh(false);
                    metrics::record_backend_error(
                        &ctx.slot.backend_name().await,
                        Operation::RefreshLiveness,
                    );
                    warn!(member_id = %ctx.entry.id(), error = %e, "Liveness refresh failed");

                    let since_last_success = last_success.elapsed();
                    if !lost && since_last_success > alive_timeout {
                        lost = true;
                        events::liveness_lost(&ctx.entry.id(), since_last_success.as_secs());
                        ctx.emit(DiscoveryEvent::LivenessLost { since_last_success });
                    }
                }
            }
        }

        debug!("Alive timer stopped");
    })
}

/// Enumerates alive nodes every `refresh_interval` and reports them.
///
/// The first round runs immediately so the host gets its initial view right
/// after joining. A failed round reports nothing.
pub(super) fn spawn_refresh_task(
    ctx: Arc<TaskContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.settings.refresh_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while next_tick(&mut interval, &mut shutdown).await {
            refresh_nodes(&ctx).await;
        }

        debug!("Refresh timer stopped");
    })
}

async fn refresh_nodes(ctx: &TaskContext) {
    let started = Instant::now();
    match ctx.slot.enumerate(true).await {
        Ok(nodes) => {
            metrics::record_enumeration(true, started.elapsed());
            metrics::set_discovered_nodes(
                ctx.settings.namespace(),
                &ctx.entry.address.to_string(),
                nodes.len(),
            );

            let healthy = nodes.iter().filter(|n| n.healthy).count();
            let previous = ctx.latest.write().await.replace(nodes.clone());
            events::nodes_refreshed(previous.map(|p| p.len()), healthy, nodes.len());
            ctx.emit(DiscoveryEvent::NodesRefreshed(nodes));
        }
        Err(e) => {
            metrics::record_enumeration(false, started.elapsed());
            metrics::record_backend_error(&ctx.slot.backend_name().await, Operation::Enumerate);
            warn!(error = %e, "Node enumeration failed");
        }
    }
}

/// Replaces the backend client every `restart_interval`
pub(super) fn spawn_restart_task(
    ctx: Arc<TaskContext>,
    restart_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_after_first(restart_interval);

        while next_tick(&mut interval, &mut shutdown).await {
            debug!("Restarting backend client");
            if let Err(e) = restart_client(&ctx).await {
                debug!(error = %e, "Scheduled client restart failed");
            }
        }

        debug!("Restart timer stopped");
    })
}

/// Swap in a fresh backend client and tell the host
pub(super) async fn restart_client(ctx: &TaskContext) -> Result<u64, DiscoveryError> {
    let backend = ctx.slot.backend_name().await;
    match ctx.slot.restart().await {
        Ok(restarts) => {
            metrics::record_client_restart(true);
            events::client_restarted(&backend, restarts);
            ctx.emit(DiscoveryEvent::ClientRestarted { restarts });
            Ok(restarts)
        }
        Err(e) => {
            metrics::record_client_restart(false);
            events::client_restart_failed(&backend, &e.to_string());
            Err(e.into())
        }
    }
}
