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

//! Anti-entropy gossip engine.
//!
//! Four-step digest/delta exchange: the initiator sends version summaries,
//! the responder answers for shared channels, the initiator requests deltas
//! for streams it does not dominate, and the responder ships the missing
//! entries. Pending delta requests are deduplicated per `(channel, stream)`
//! until a response arrives or the request expires.
//!
//! Like the failure detector, the engine is a deterministic state machine:
//! entry points take the current time and return the messages to send plus
//! the recoverable errors to report.

use crate::core::channel::{ChannelAggregate, ChannelError, MergeResult, RetentionPolicy};
use crate::core::clock::HlcClock;
use crate::core::events::{ChannelSyncErrorKind, StorageSyncErrorKind, SyncError};
use crate::core::repository::EntryRepository;
use crate::core::types::{ChannelId, NodeId, StreamId};
use crate::networking::peer_registry::PeerRegistry;
use crate::networking::wire::{
    DeltaRequest, DeltaResponse, DigestRequest, DigestResponse, WireMessage,
};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::debug;

/// Hard entry cap for one delta response.
const DELTA_BATCH_MAX_ENTRIES: usize = 500;

/// Anti-entropy engine state: pending delta requests and policy knobs.
pub struct GossipEngine {
    local_node: NodeId,
    pending: BTreeMap<(ChannelId, StreamId), u64>,
    pending_expiry_ms: u64,
    congestion_threshold: usize,
    /// Payload budget per delta response, kept under the transport frame
    /// limit so a batch plus framing always fits.
    batch_budget_bytes: usize,
}

impl GossipEngine {
    /// Engine for `local_node`.
    pub fn new(
        local_node: NodeId,
        pending_expiry_ms: u64,
        congestion_threshold: usize,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            local_node,
            pending: BTreeMap::new(),
            pending_expiry_ms,
            congestion_threshold,
            batch_budget_bytes: (max_payload_bytes / 4) * 3,
        }
    }

    /// Non-expired pending delta requests.
    pub fn pending_request_count(&self, now_ms: u64) -> usize {
        self.pending
            .values()
            .filter(|at| now_ms.saturating_sub(**at) < self.pending_expiry_ms)
            .count()
    }

    /// Drop all pending bookkeeping (stop/dispose).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn pending_active(&self, key: &(ChannelId, StreamId), now_ms: u64) -> bool {
        self.pending
            .get(key)
            .map(|at| now_ms.saturating_sub(*at) < self.pending_expiry_ms)
            .unwrap_or(false)
    }

    /// Begin one gossip round: pick a reachable peer and send it our
    /// digests. Skipped entirely under transport backpressure or when there
    /// is nothing to summarize or nobody to talk to.
    pub fn start_round(
        &mut self,
        total_pending_sends: usize,
        channels: &BTreeMap<ChannelId, ChannelAggregate>,
        repo: &dyn EntryRepository,
        registry: &PeerRegistry,
        rng: &mut dyn RngCore,
    ) -> Option<(NodeId, WireMessage)> {
        if total_pending_sends > self.congestion_threshold {
            debug!(
                backlog = total_pending_sends,
                "gossip round skipped: transport backpressure"
            );
            return None;
        }
        if channels.is_empty() {
            return None;
        }
        let peer = registry.select_random_reachable_peer(rng)?;
        let digests = channels
            .values()
            .map(|agg| agg.compute_digest(repo))
            .collect();
        Some((
            peer,
            WireMessage::DigestRequest(DigestRequest {
                sender: self.local_node.clone(),
                digests,
            }),
        ))
    }

    /// Step 2: answer a digest request with digests for the channels we
    /// also carry.
    pub fn handle_digest_request(
        &self,
        request: &DigestRequest,
        channels: &BTreeMap<ChannelId, ChannelAggregate>,
        repo: &dyn EntryRepository,
    ) -> WireMessage {
        let digests = request
            .digests
            .iter()
            .filter_map(|d| channels.get(&d.channel_id))
            .map(|agg| agg.compute_digest(repo))
            .collect();
        WireMessage::DigestResponse(DigestResponse {
            sender: self.local_node.clone(),
            digests,
        })
    }

    /// Step 3: for every stream in the response we do not dominate, request
    /// a delta — unless one is already in flight for that stream.
    pub fn handle_digest_response(
        &mut self,
        response: &DigestResponse,
        now_ms: u64,
        channels: &BTreeMap<ChannelId, ChannelAggregate>,
        repo: &dyn EntryRepository,
    ) -> (Vec<WireMessage>, Vec<SyncError>) {
        let mut requests = Vec::new();
        let mut errors = Vec::new();
        for digest in &response.digests {
            if !channels.contains_key(&digest.channel_id) {
                errors.push(SyncError::ChannelSync {
                    channel: digest.channel_id.clone(),
                    kind: ChannelSyncErrorKind::ProtocolError,
                    detail: format!("digest from {} for unknown channel", response.sender),
                });
                continue;
            }
            for stream in &digest.streams {
                let ours = repo.version_vector(&digest.channel_id, &stream.stream_id);
                if ours.dominates(&stream.version) {
                    continue;
                }
                let key = (digest.channel_id.clone(), stream.stream_id.clone());
                if self.pending_active(&key, now_ms) {
                    debug!(
                        channel = %key.0,
                        stream = %key.1,
                        "delta request suppressed: one already in flight"
                    );
                    continue;
                }
                self.pending.insert(key.clone(), now_ms);
                requests.push(WireMessage::DeltaRequest(DeltaRequest {
                    sender: self.local_node.clone(),
                    channel_id: key.0,
                    stream_id: key.1,
                    since: ours,
                }));
            }
        }
        (requests, errors)
    }

    /// Step 4a (responder): ship the entries the requester is missing,
    /// batched to a transport-safe size.
    pub fn handle_delta_request(
        &self,
        request: &DeltaRequest,
        channels: &BTreeMap<ChannelId, ChannelAggregate>,
        repo: &dyn EntryRepository,
    ) -> Result<WireMessage, SyncError> {
        let Some(aggregate) = channels.get(&request.channel_id) else {
            return Err(SyncError::ChannelSync {
                channel: request.channel_id.clone(),
                kind: ChannelSyncErrorKind::ChannelNotFound,
                detail: format!("delta request from {}", request.sender),
            });
        };
        let delta = aggregate
            .compute_delta(&request.stream_id, &request.since, repo)
            .map_err(|_| SyncError::ChannelSync {
                channel: request.channel_id.clone(),
                kind: ChannelSyncErrorKind::StreamNotFound,
                detail: format!(
                    "delta request from {} for stream {}",
                    request.sender, request.stream_id
                ),
            })?;

        let mut entries = Vec::new();
        let mut batch_bytes = 0usize;
        for entry in delta.entries {
            let entry_bytes = entry.payload.len();
            if !entries.is_empty()
                && (batch_bytes + entry_bytes > self.batch_budget_bytes
                    || entries.len() >= DELTA_BATCH_MAX_ENTRIES)
            {
                break;
            }
            batch_bytes += entry_bytes;
            entries.push(entry);
        }
        Ok(WireMessage::DeltaResponse(DeltaResponse {
            sender: self.local_node.clone(),
            channel_id: request.channel_id.clone(),
            stream_id: request.stream_id.clone(),
            entries,
        }))
    }

    /// Step 4b (initiator): merge a delta response. Clears the pending flag
    /// whether or not the response carries entries, advances the clock past
    /// the batch, then merges.
    pub fn handle_delta_response(
        &mut self,
        response: DeltaResponse,
        now_ms: u64,
        channels: &mut BTreeMap<ChannelId, ChannelAggregate>,
        repo: &mut dyn EntryRepository,
        clock: &mut HlcClock,
    ) -> (Option<MergeResult>, Vec<SyncError>) {
        self.pending
            .remove(&(response.channel_id.clone(), response.stream_id.clone()));

        let mut errors = Vec::new();
        let Some(aggregate) = channels.get_mut(&response.channel_id) else {
            errors.push(SyncError::ChannelSync {
                channel: response.channel_id.clone(),
                kind: ChannelSyncErrorKind::ProtocolError,
                detail: format!("delta response from {} for unknown channel", response.sender),
            });
            return (None, errors);
        };
        if response.entries.is_empty() {
            return (None, errors);
        }

        // Streams propagate through digests; a stream first heard of in a
        // delta materializes locally with keep-all retention.
        if !aggregate.has_stream(&response.stream_id) {
            aggregate.create_stream(response.stream_id.clone(), RetentionPolicy::KeepAll);
        }

        if let Some(max_hlc) = response.entries.iter().map(|e| e.timestamp).max() {
            clock.receive(max_hlc, now_ms);
        }

        match aggregate.merge_entries(&response.stream_id, response.entries, repo) {
            // Buffer overflows surface through the aggregate's own events;
            // the coordinator mirrors them onto the error stream.
            Ok(result) => (Some(result), errors),
            Err(ChannelError::Store(e)) => {
                errors.push(SyncError::StorageSync {
                    kind: StorageSyncErrorKind::EntryStorageError,
                    detail: e.to_string(),
                });
                (None, errors)
            }
            Err(_) => {
                errors.push(SyncError::ChannelSync {
                    channel: response.channel_id.clone(),
                    kind: ChannelSyncErrorKind::StreamNotFound,
                    detail: format!("merge failed for stream {}", response.stream_id),
                });
                (None, errors)
            }
        }
    }
}

impl std::fmt::Debug for GossipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipEngine")
            .field("local_node", &self.local_node)
            .field("pending", &self.pending.len())
            .finish()
    }
}
