//! Cluster Membership View
//!
//! Consumes discovery events and keeps the set of known peers, logging peers
//! as they appear in or drop out of successive node lists.

use cairn_core::{DiscoveredNode, DiscoveryEvent, NodeAddress};
use metrics::counter;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peers added and removed by one node list
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub joined: Vec<NodeAddress>,
    pub departed: Vec<NodeAddress>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

/// Known peers, excluding the local node
#[derive(Debug)]
pub struct MembershipView {
    local: NodeAddress,
    peers: BTreeSet<NodeAddress>,
}

impl MembershipView {
    pub fn new(local: NodeAddress) -> Self {
        Self {
            local,
            peers: BTreeSet::new(),
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeAddress> {
        self.peers.iter()
    }

    /// Replace the peer set with `nodes`. A node listed under several services
    /// counts once.
    pub fn apply(&mut self, nodes: &[DiscoveredNode]) -> MembershipDiff {
        let next: BTreeSet<NodeAddress> = nodes
            .iter()
            .map(|n| n.address.clone())
            .filter(|address| *address != self.local)
            .collect();

        let diff = MembershipDiff {
            joined: next.difference(&self.peers).cloned().collect(),
            departed: self.peers.difference(&next).cloned().collect(),
        };
        self.peers = next;
        diff
    }
}

fn peer_joined(address: &NodeAddress) {
    info!(event_type = "peer_joined", address = %address, "Peer joined");
    counter!("cairn_membership_changes_total", "change" => "joined").increment(1);
}

fn peer_departed(address: &NodeAddress) {
    warn!(event_type = "peer_departed", address = %address, "Peer departed");
    counter!("cairn_membership_changes_total", "change" => "departed").increment(1);
}

/// Drain discovery events until `Stopped` arrives or the sender is dropped
pub fn spawn_event_consumer(
    local: NodeAddress,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) -> JoinHandle<MembershipView> {
    tokio::spawn(async move {
        let mut view = MembershipView::new(local);

        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::NodesRefreshed(nodes) => {
                    let diff = view.apply(&nodes);
                    diff.joined.iter().for_each(peer_joined);
                    diff.departed.iter().for_each(peer_departed);
                    if diff.is_empty() {
                        debug!(peers = view.peers.len(), "Membership unchanged");
                    }
                }
                DiscoveryEvent::Stopped => break,
                other => debug!(event = ?other, "Discovery event"),
            }
        }

        view
    })
}
