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

//! SWIM failure detector with late-ack handling.
//!
//! The detector is a deterministic state machine: every entry point takes
//! the current time and returns the sends and timer requests for the
//! coordinator to execute. Timeouts are observational; pending probes are
//! cleared only at end of round, so an ack that misses the direct timeout
//! but lands before cleanup still counts as success.

use crate::core::config::CoordinatorConfig;
use crate::core::events::PeerStatus;
use crate::core::types::NodeId;
use crate::networking::peer_registry::PeerRegistry;
use crate::networking::rtt::RttTracker;
use crate::networking::wire::{Ack, Ping, PingReq, WireMessage};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::debug;

/// Stale relay bookkeeping is purged after this long.
const RELAY_EXPIRY_MS: u64 = 30_000;

/// What the detector wants done, in order.
#[derive(Debug)]
pub enum SwimAction {
    /// Send a message (always high priority).
    Send {
        /// Destination peer.
        to: NodeId,
        /// The message.
        message: WireMessage,
    },
    /// Fire `handle_direct_timeout(sequence)` after `after_ms`.
    ScheduleDirectTimeout {
        /// Probe sequence.
        sequence: u64,
        /// Delay in milliseconds.
        after_ms: u64,
    },
    /// Fire `handle_round_end(sequence)` after `after_ms`.
    ScheduleRoundEnd {
        /// Probe sequence.
        sequence: u64,
        /// Delay in milliseconds.
        after_ms: u64,
    },
}

#[derive(Debug)]
struct ProbeState {
    target: NodeId,
    sent_at_ms: u64,
    acked: bool,
}

#[derive(Debug)]
struct RelayState {
    origin: NodeId,
    origin_sequence: u64,
    target: NodeId,
    created_at_ms: u64,
}

/// Per-node failure detector state.
pub struct FailureDetector {
    local_node: NodeId,
    suspicion_threshold: u32,
    unreachable_threshold: u32,
    unreachable_probe_interval: u32,
    startup_grace_period_ms: u64,
    indirect_probe_count: usize,
    next_sequence: u64,
    round_counter: u64,
    pending_probes: BTreeMap<u64, ProbeState>,
    pending_relays: BTreeMap<u64, RelayState>,
}

impl FailureDetector {
    /// Detector for `local_node` with the given policy knobs.
    pub fn new(local_node: NodeId, config: &CoordinatorConfig) -> Self {
        Self {
            local_node,
            suspicion_threshold: config.suspicion_threshold,
            unreachable_threshold: config.unreachable_threshold,
            unreachable_probe_interval: config.unreachable_probe_interval,
            startup_grace_period_ms: config.startup_grace_period_ms,
            indirect_probe_count: config.indirect_probe_count,
            next_sequence: 0,
            round_counter: 0,
            pending_probes: BTreeMap::new(),
            pending_relays: BTreeMap::new(),
        }
    }

    /// Probes currently awaiting round cleanup.
    pub fn pending_probe_count(&self) -> usize {
        self.pending_probes.len()
    }

    /// Drop all in-flight probe and relay bookkeeping (stop/dispose).
    pub fn clear(&mut self) {
        self.pending_probes.clear();
        self.pending_relays.clear();
    }

    fn next_seq(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Begin one probe round: pick a target, ping it, arm the two timers.
    pub fn start_probe_round(
        &mut self,
        now_ms: u64,
        registry: &mut PeerRegistry,
        rtt: &RttTracker,
        rng: &mut dyn RngCore,
    ) -> Vec<SwimAction> {
        self.round_counter += 1;
        self.pending_relays
            .retain(|_, r| now_ms.saturating_sub(r.created_at_ms) < RELAY_EXPIRY_MS);

        let probe_unreachable =
            self.round_counter % u64::from(self.unreachable_probe_interval) == 0;
        let candidates: Vec<&crate::networking::peer_registry::Peer> = registry
            .all_peers()
            .filter(|p| p.status != PeerStatus::Unreachable || probe_unreachable)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        let pick = candidates[(rng.next_u64() as usize) % candidates.len()];
        let target = pick.id.clone();
        let suspect = pick.status != PeerStatus::Reachable;

        if now_ms.saturating_sub(pick.added_at_ms) < self.startup_grace_period_ms {
            debug!(peer = %target, "probe skipped: startup grace");
            return Vec::new();
        }

        let ping_timeout =
            rtt.ping_timeout_with(pick.metrics.rtt_estimate.as_ref());
        // The indirect phase gets the same adaptive budget as the direct
        // one; with no intermediaries it acts as the late-ack grace window.
        let indirect_timeout = ping_timeout;

        let sequence = self.next_seq();
        self.pending_probes.insert(
            sequence,
            ProbeState {
                target: target.clone(),
                sent_at_ms: now_ms,
                acked: false,
            },
        );

        let ping = WireMessage::Ping(Ping {
            sender: self.local_node.clone(),
            sequence,
            incarnation: registry.local_incarnation(),
            suspect,
        });
        vec![
            SwimAction::Send {
                to: target,
                message: ping,
            },
            SwimAction::ScheduleDirectTimeout {
                sequence,
                after_ms: ping_timeout,
            },
            SwimAction::ScheduleRoundEnd {
                sequence,
                after_ms: ping_timeout + indirect_timeout,
            },
        ]
    }

    /// Direct timeout: fan out indirect probes if the ack has not landed.
    /// With no usable intermediaries (the 2-device case) the round simply
    /// waits out the grace window.
    pub fn handle_direct_timeout(
        &mut self,
        sequence: u64,
        registry: &PeerRegistry,
        rng: &mut dyn RngCore,
    ) -> Vec<SwimAction> {
        let Some(probe) = self.pending_probes.get(&sequence) else {
            return Vec::new();
        };
        if probe.acked {
            return Vec::new();
        }
        let target = probe.target.clone();

        let mut pool: Vec<NodeId> = registry
            .reachable_peers()
            .into_iter()
            .map(|p| p.id.clone())
            .filter(|id| id != &target)
            .collect();
        let mut actions = Vec::new();
        let incarnation = registry.local_incarnation();
        for _ in 0..self.indirect_probe_count.min(pool.len()) {
            let idx = (rng.next_u64() as usize) % pool.len();
            let intermediary = pool.swap_remove(idx);
            actions.push(SwimAction::Send {
                to: intermediary,
                message: WireMessage::PingReq(PingReq {
                    sender: self.local_node.clone(),
                    sequence,
                    target: target.clone(),
                    incarnation,
                }),
            });
        }
        if actions.is_empty() {
            debug!(peer = %target, "no intermediaries; waiting out late-ack grace");
        }
        actions
    }

    /// Round cleanup: the only place pending probes are cleared. A probe
    /// that never got acked (directly, indirectly, or late) counts one
    /// failure and drives the status machine.
    pub fn handle_round_end(&mut self, sequence: u64, registry: &mut PeerRegistry) {
        let Some(probe) = self.pending_probes.remove(&sequence) else {
            return;
        };
        if probe.acked {
            return;
        }
        let count = registry.increment_failed_probe_count(&probe.target);
        let Some(peer) = registry.get(&probe.target) else {
            return;
        };
        match peer.status {
            PeerStatus::Reachable if count >= self.suspicion_threshold => {
                registry.update_status(&probe.target, PeerStatus::Suspected);
            }
            PeerStatus::Suspected if count >= self.unreachable_threshold => {
                registry.update_status(&probe.target, PeerStatus::Unreachable);
            }
            _ => {}
        }
    }

    /// Incoming ping: revive the sender, refute if it suspects us, ack.
    pub fn handle_ping(
        &mut self,
        ping: &Ping,
        now_ms: u64,
        registry: &mut PeerRegistry,
    ) -> Vec<SwimAction> {
        registry.update_contact(&ping.sender, now_ms);
        registry.update_incarnation(&ping.sender, ping.incarnation);
        self.revive(&ping.sender, registry);

        if ping.suspect {
            // Someone believes we are down; refute with a fresh incarnation.
            registry.increment_local_incarnation();
        }

        vec![SwimAction::Send {
            to: ping.sender.clone(),
            message: WireMessage::Ack(Ack {
                sender: self.local_node.clone(),
                sequence: ping.sequence,
                incarnation: registry.local_incarnation(),
            }),
        }]
    }

    /// Incoming ack: close the matching relay or probe.
    pub fn handle_ack(
        &mut self,
        ack: &Ack,
        now_ms: u64,
        registry: &mut PeerRegistry,
        rtt: &mut RttTracker,
    ) -> Vec<SwimAction> {
        registry.update_contact(&ack.sender, now_ms);
        registry.update_incarnation(&ack.sender, ack.incarnation);
        self.revive(&ack.sender, registry);

        // Relay leg: the target answered an indirect ping we sent on
        // someone else's behalf. Forward the ack under the origin sequence.
        let relay_matches = self
            .pending_relays
            .get(&ack.sequence)
            .map(|r| r.target == ack.sender)
            .unwrap_or(false);
        if relay_matches {
            if let Some(relay) = self.pending_relays.remove(&ack.sequence) {
                return vec![SwimAction::Send {
                    to: relay.origin,
                    message: WireMessage::Ack(Ack {
                        sender: self.local_node.clone(),
                        sequence: relay.origin_sequence,
                        incarnation: registry.local_incarnation(),
                    }),
                }];
            }
        }

        // Probe leg: direct, indirect, or late — all count as success until
        // round cleanup.
        if let Some(probe) = self.pending_probes.get_mut(&ack.sequence) {
            if !probe.acked {
                probe.acked = true;
                let sample = now_ms.saturating_sub(probe.sent_at_ms);
                let target = probe.target.clone();
                rtt.observe(sample);
                registry.record_peer_rtt(&target, sample);
                registry.update_contact(&target, now_ms);
                registry.reset_failed_probe_count(&target);
                self.revive(&target, registry);
            }
        }
        Vec::new()
    }

    /// Incoming ping-req: probe the target on the origin's behalf.
    pub fn handle_ping_req(
        &mut self,
        req: &PingReq,
        now_ms: u64,
        registry: &mut PeerRegistry,
    ) -> Vec<SwimAction> {
        registry.update_contact(&req.sender, now_ms);
        registry.update_incarnation(&req.sender, req.incarnation);
        self.revive(&req.sender, registry);

        let relay_sequence = self.next_seq();
        self.pending_relays.insert(
            relay_sequence,
            RelayState {
                origin: req.sender.clone(),
                origin_sequence: req.sequence,
                target: req.target.clone(),
                created_at_ms: now_ms,
            },
        );
        vec![SwimAction::Send {
            to: req.target.clone(),
            message: WireMessage::Ping(Ping {
                sender: self.local_node.clone(),
                sequence: relay_sequence,
                incarnation: registry.local_incarnation(),
                suspect: false,
            }),
        }]
    }

    /// Any direct sign of life brings a known peer back to reachable.
    fn revive(&mut self, peer: &NodeId, registry: &mut PeerRegistry) {
        let Some(p) = registry.get(peer) else {
            return;
        };
        if p.status != PeerStatus::Reachable {
            registry.reset_failed_probe_count(peer);
            registry.update_status(peer, PeerStatus::Reachable);
        }
    }
}

impl std::fmt::Debug for FailureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureDetector")
            .field("local_node", &self.local_node)
            .field("round_counter", &self.round_counter)
            .field("pending_probes", &self.pending_probes.len())
            .field("pending_relays", &self.pending_relays.len())
            .finish()
    }
}
