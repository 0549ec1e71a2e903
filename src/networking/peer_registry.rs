// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Local authoritative view of the cluster.
//!
//! The registry backs both gossip peer selection and the failure detector.
//! Mutations targeting unknown peers emit `PeerOperationSkipped` instead of
//! failing; that event is the observability contract for races between
//! removal and in-flight protocol work.
//!
//! Membership lists on channels are local metadata only. The registry knows
//! every peer the host connected, member or not.

use crate::core::events::{DomainEvent, PeerStatus};
use crate::core::types::NodeId;
use crate::networking::rtt::RttEstimate;
use rand::RngCore;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Length of the message-rate accounting window.
const RATE_WINDOW_MS: u64 = 1_000;

/// Registry errors (programming errors; protocol races never surface here).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The local node cannot be its own peer.
    #[error("cannot add local node as peer")]
    AddSelf,
}

/// Traffic counters for one peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerMetrics {
    /// Messages received from the peer.
    pub messages_received: u64,
    /// Messages sent to the peer.
    pub messages_sent: u64,
    /// Bytes received from the peer.
    pub bytes_received: u64,
    /// Bytes sent to the peer.
    pub bytes_sent: u64,
    /// Start of the current rate window.
    pub window_start_ms: u64,
    /// Messages received inside the current window.
    pub messages_in_window: u64,
    /// Per-peer RTT estimate, once a sample exists.
    pub rtt_estimate: Option<RttEstimate>,
}

impl PeerMetrics {
    fn roll_window(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.window_start_ms) >= RATE_WINDOW_MS {
            self.window_start_ms = now_ms;
            self.messages_in_window = 0;
        }
    }
}

/// One known peer.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Peer identity.
    pub id: NodeId,
    /// Reachability as seen locally.
    pub status: PeerStatus,
    /// Highest incarnation heard from the peer.
    pub incarnation: u64,
    /// When the host added the peer (startup grace anchor).
    pub added_at_ms: u64,
    /// Last time any message arrived from the peer.
    pub last_contact_ms: u64,
    /// Last time anti-entropy ran against the peer.
    pub last_anti_entropy_ms: u64,
    /// Consecutive failed probe rounds.
    pub failed_probe_count: u32,
    /// Traffic counters.
    pub metrics: PeerMetrics,
}

/// Peer persistence, for hosts that want the known-peer set to survive
/// restarts (the reconnect path re-issues `add_peer` from it).
pub trait PeerRepository: Send {
    /// Stored peer, if any.
    fn find_by_id(&self, id: &NodeId) -> Option<Peer>;
    /// Insert or replace.
    fn save(&mut self, peer: Peer);
    /// Remove.
    fn delete(&mut self, id: &NodeId);
    /// All stored peers.
    fn find_all(&self) -> Vec<Peer>;
    /// Stored peers currently marked reachable.
    fn find_reachable(&self) -> Vec<Peer>;
    /// Whether `id` is stored.
    fn exists(&self, id: &NodeId) -> bool;
    /// Number of stored peers.
    fn count(&self) -> usize;
}

/// In-memory peer repository.
#[derive(Debug, Default)]
pub struct InMemoryPeerStore {
    peers: BTreeMap<NodeId, Peer>,
}

impl InMemoryPeerStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerRepository for InMemoryPeerStore {
    fn find_by_id(&self, id: &NodeId) -> Option<Peer> {
        self.peers.get(id).cloned()
    }
    fn save(&mut self, peer: Peer) {
        self.peers.insert(peer.id.clone(), peer);
    }
    fn delete(&mut self, id: &NodeId) {
        self.peers.remove(id);
    }
    fn find_all(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }
    fn find_reachable(&self) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.status == PeerStatus::Reachable)
            .cloned()
            .collect()
    }
    fn exists(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }
    fn count(&self) -> usize {
        self.peers.len()
    }
}

/// Singleton per node: peer set, statuses, incarnations, counters.
pub struct PeerRegistry {
    local_node: NodeId,
    local_incarnation: u64,
    peers: BTreeMap<NodeId, Peer>,
    events: Vec<DomainEvent>,
}

impl PeerRegistry {
    /// Registry for `local_node`, resuming `local_incarnation` (0 on a
    /// fresh node).
    pub fn new(local_node: NodeId, local_incarnation: u64) -> Self {
        Self {
            local_node,
            local_incarnation,
            peers: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// The owning node.
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Current local incarnation.
    pub fn local_incarnation(&self) -> u64 {
        self.local_incarnation
    }

    /// Adopt a persisted local incarnation if it is ahead of the current
    /// one (restart monotonicity).
    pub fn adopt_local_incarnation(&mut self, incarnation: u64) {
        if incarnation > self.local_incarnation {
            self.local_incarnation = incarnation;
        }
    }

    /// Bump the local incarnation (refuting a stale suspicion).
    pub fn increment_local_incarnation(&mut self) -> u64 {
        self.local_incarnation += 1;
        info!(
            incarnation = self.local_incarnation,
            "local incarnation incremented"
        );
        self.local_incarnation
    }

    /// Drain uncommitted domain events in emission order.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    /// Add a peer, or revive it if the host re-adds a known one. Returns
    /// true when the peer is new.
    pub fn add_peer(&mut self, id: NodeId, now_ms: u64) -> Result<bool, RegistryError> {
        if id == self.local_node {
            return Err(RegistryError::AddSelf);
        }
        if self.peers.contains_key(&id) {
            // Host-driven re-add revives an unreachable peer.
            self.set_status(&id, PeerStatus::Reachable);
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.failed_probe_count = 0;
                peer.added_at_ms = now_ms;
            }
            return Ok(false);
        }
        self.peers.insert(
            id.clone(),
            Peer {
                id: id.clone(),
                status: PeerStatus::Reachable,
                incarnation: 0,
                added_at_ms: now_ms,
                last_contact_ms: now_ms,
                last_anti_entropy_ms: 0,
                failed_probe_count: 0,
                metrics: PeerMetrics {
                    window_start_ms: now_ms,
                    ..PeerMetrics::default()
                },
            },
        );
        info!(peer = %id, "peer added");
        self.events.push(DomainEvent::PeerAdded { peer: id });
        Ok(true)
    }

    /// Remove a peer. Unknown peers are a skipped operation.
    pub fn remove_peer(&mut self, id: &NodeId) -> bool {
        if self.peers.remove(id).is_none() {
            self.skip(id, "remove_peer");
            return false;
        }
        info!(peer = %id, "peer removed");
        self.events.push(DomainEvent::PeerRemoved { peer: id.clone() });
        true
    }

    /// Set a peer's status, emitting `PeerStatusChanged` on change.
    pub fn update_status(&mut self, id: &NodeId, new_status: PeerStatus) {
        if !self.peers.contains_key(id) {
            self.skip(id, "update_status");
            return;
        }
        self.set_status(id, new_status);
    }

    fn set_status(&mut self, id: &NodeId, new_status: PeerStatus) {
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        if peer.status == new_status {
            return;
        }
        let old_status = peer.status;
        peer.status = new_status;
        info!(peer = %id, %old_status, %new_status, "peer status changed");
        self.events.push(DomainEvent::PeerStatusChanged {
            peer: id.clone(),
            old_status,
            new_status,
        });
    }

    /// Record contact from a peer.
    pub fn update_contact(&mut self, id: &NodeId, now_ms: u64) {
        match self.peers.get_mut(id) {
            Some(peer) => peer.last_contact_ms = now_ms,
            None => self.skip(id, "update_contact"),
        }
    }

    /// Record an anti-entropy exchange with a peer.
    pub fn update_anti_entropy(&mut self, id: &NodeId, now_ms: u64) {
        match self.peers.get_mut(id) {
            Some(peer) => peer.last_anti_entropy_ms = now_ms,
            None => self.skip(id, "update_anti_entropy"),
        }
    }

    /// Adopt a higher incarnation heard for a peer. A refuted suspicion
    /// resets the peer to reachable.
    pub fn update_incarnation(&mut self, id: &NodeId, incarnation: u64) {
        let Some(peer) = self.peers.get_mut(id) else {
            self.skip(id, "update_incarnation");
            return;
        };
        if incarnation <= peer.incarnation {
            return;
        }
        peer.incarnation = incarnation;
        if peer.status != PeerStatus::Reachable {
            peer.failed_probe_count = 0;
            self.set_status(id, PeerStatus::Reachable);
        }
    }

    /// Count one failed probe round. Returns the new count (0 for unknown
    /// peers).
    pub fn increment_failed_probe_count(&mut self, id: &NodeId) -> u32 {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.failed_probe_count += 1;
                peer.failed_probe_count
            }
            None => {
                self.skip(id, "increment_failed_probe_count");
                0
            }
        }
    }

    /// Reset the failed-probe counter after a successful probe.
    pub fn reset_failed_probe_count(&mut self, id: &NodeId) {
        match self.peers.get_mut(id) {
            Some(peer) => peer.failed_probe_count = 0,
            None => self.skip(id, "reset_failed_probe_count"),
        }
    }

    /// Account one received message.
    pub fn record_message_received(&mut self, id: &NodeId, bytes: usize, now_ms: u64) {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.metrics.roll_window(now_ms);
                peer.metrics.messages_received += 1;
                peer.metrics.messages_in_window += 1;
                peer.metrics.bytes_received += bytes as u64;
            }
            None => self.skip(id, "record_message_received"),
        }
    }

    /// Account one sent message.
    pub fn record_message_sent(&mut self, id: &NodeId, bytes: usize, _now_ms: u64) {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.metrics.messages_sent += 1;
                peer.metrics.bytes_sent += bytes as u64;
            }
            None => self.skip(id, "record_message_sent"),
        }
    }

    /// Fold an RTT sample into the peer's estimate.
    pub fn record_peer_rtt(&mut self, id: &NodeId, sample_ms: u64) {
        match self.peers.get_mut(id) {
            Some(peer) => match peer.metrics.rtt_estimate.as_mut() {
                Some(est) => est.observe(sample_ms),
                None => {
                    peer.metrics.rtt_estimate = Some(RttEstimate::from_first_sample(sample_ms));
                }
            },
            None => self.skip(id, "record_peer_rtt"),
        }
    }

    /// Whether `id` is known and reachable.
    pub fn is_reachable(&self, id: &NodeId) -> bool {
        self.peers
            .get(id)
            .map(|p| p.status == PeerStatus::Reachable)
            .unwrap_or(false)
    }

    /// Peer by id.
    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Every known peer.
    pub fn all_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers currently marked reachable.
    pub fn reachable_peers(&self) -> Vec<&Peer> {
        self.peers
            .values()
            .filter(|p| p.status == PeerStatus::Reachable)
            .collect()
    }

    /// Uniform random reachable peer, if any.
    pub fn select_random_reachable_peer(&self, rng: &mut dyn RngCore) -> Option<NodeId> {
        let reachable = self.reachable_peers();
        if reachable.is_empty() {
            return None;
        }
        let idx = (rng.next_u64() as usize) % reachable.len();
        Some(reachable[idx].id.clone())
    }

    /// Metrics for one peer.
    pub fn get_metrics(&self, id: &NodeId) -> Option<PeerMetrics> {
        self.peers.get(id).map(|p| p.metrics)
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn skip(&mut self, id: &NodeId, operation: &'static str) {
        self.events.push(DomainEvent::PeerOperationSkipped {
            peer: id.clone(),
            operation,
        });
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("local_node", &self.local_node)
            .field("local_incarnation", &self.local_incarnation)
            .field("peers", &self.peers.len())
            .finish()
    }
}
