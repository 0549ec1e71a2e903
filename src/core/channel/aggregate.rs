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
#![warn(missing_docs)]

//! Channel aggregate: membership, stream configuration, merge semantics,
//! out-of-order buffering, retention, and state materialization.
//!
//! Entries themselves live in the entry repository; the aggregate holds
//! only indexes and buffers. Domain events accumulate uncommitted until the
//! owner drains them with [`ChannelAggregate::take_events`].

use crate::core::channel::retention::{base_version_of, CompactionResult, RetentionPolicy};
use crate::core::events::DomainEvent;
use crate::core::repository::{ChannelSnapshot, EntryRepository, StoreError};
use crate::core::types::{
    ChannelId, Hlc, LogEntry, LogEntryId, NodeId, StreamId, VersionVector,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Aggregate operation failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The stream does not exist in this channel.
    #[error("stream not found")]
    StreamNotFound,
    /// The local node cannot leave its own channel.
    #[error("cannot remove local node")]
    RemoveLocalNode,
    /// No materializer registered for the stream.
    #[error("no materializer registered")]
    NoMaterializer,
    /// The repository failed.
    #[error("store")]
    Store(#[from] StoreError),
}

/// Version-vector summary of one stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDigest {
    /// Summarized stream.
    pub stream_id: StreamId,
    /// Delivered sequences per author.
    pub version: VersionVector,
}

/// Version-vector summary of one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDigest {
    /// Summarized channel.
    pub channel_id: ChannelId,
    /// Per-stream summaries.
    pub streams: Vec<StreamDigest>,
}

/// Entries needed to bring a peer up to parity on one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDelta {
    /// Owning channel.
    pub channel_id: ChannelId,
    /// Owning stream.
    pub stream_id: StreamId,
    /// Missing entries in stream order.
    pub entries: Vec<LogEntry>,
}

/// Outcome of merging a batch of remote entries into a stream.
#[derive(Clone, Debug, Default)]
pub struct MergeResult {
    /// Entries newly delivered, in delivery order.
    pub new_entries: Vec<LogEntry>,
    /// Entries already present.
    pub duplicates: usize,
    /// Entries parked in the out-of-order buffer.
    pub out_of_order: usize,
    /// Buffered entries dropped by cap enforcement.
    pub dropped: usize,
    /// Entries at or below the delivery floor that are no longer stored
    /// (typically compacted away).
    pub rejected: usize,
    /// Stream version after the merge.
    pub new_version: VersionVector,
}

/// Out-of-order buffer caps.
#[derive(Clone, Copy, Debug)]
pub struct BufferLimits {
    /// Cap per `(stream, author)`.
    pub per_author: usize,
    /// Cap across all streams and authors of the channel.
    pub total: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            per_author: 100,
            total: 10_000,
        }
    }
}

/// Type-erased materializer state.
pub type BoxedState = Box<dyn Any + Send>;

struct Materializer {
    init: Box<dyn Fn() -> BoxedState + Send>,
    fold: Box<dyn Fn(BoxedState, &LogEntry) -> BoxedState + Send>,
}

/// Per-channel aggregate root.
pub struct ChannelAggregate {
    channel_id: ChannelId,
    local_node: NodeId,
    members: BTreeSet<NodeId>,
    streams: BTreeMap<StreamId, RetentionPolicy>,
    buffers: BTreeMap<(StreamId, NodeId), VecDeque<LogEntry>>,
    buffered_total: usize,
    limits: BufferLimits,
    /// Host-enforced policy: reject merged entries from non-member authors.
    /// The protocol itself never enforces membership.
    reject_non_members: bool,
    materializers: BTreeMap<StreamId, Materializer>,
    events: Vec<DomainEvent>,
}

impl ChannelAggregate {
    /// Create a channel with the local node as sole member.
    pub fn new(channel_id: ChannelId, local_node: NodeId, limits: BufferLimits) -> Self {
        let mut members = BTreeSet::new();
        members.insert(local_node.clone());
        let events = vec![DomainEvent::ChannelCreated {
            channel: channel_id.clone(),
        }];
        Self {
            channel_id,
            local_node,
            members,
            streams: BTreeMap::new(),
            buffers: BTreeMap::new(),
            buffered_total: 0,
            limits,
            reject_non_members: false,
            materializers: BTreeMap::new(),
            events,
        }
    }

    /// Reconstitute from a persisted snapshot. Emits no events.
    pub fn from_snapshot(snapshot: ChannelSnapshot, limits: BufferLimits) -> Self {
        let mut members = snapshot.members;
        // The local node is a member by construction even if the snapshot
        // was written by an older version that dropped it.
        members.insert(snapshot.local_node.clone());
        Self {
            channel_id: snapshot.channel_id,
            local_node: snapshot.local_node,
            members,
            streams: snapshot.streams,
            buffers: BTreeMap::new(),
            buffered_total: 0,
            limits,
            reject_non_members: false,
            materializers: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Toggle the host-enforced membership policy. When enabled, merged
    /// entries from authors outside the membership view are rejected and
    /// reported as `NonMemberEntriesRejected`. Off by default; the gossip
    /// protocol syncs with any peer regardless of this setting.
    pub fn set_membership_enforcement(&mut self, enforce: bool) {
        self.reject_non_members = enforce;
    }

    /// Persistable view (membership and stream policies).
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: self.channel_id.clone(),
            local_node: self.local_node.clone(),
            members: self.members.clone(),
            streams: self.streams.clone(),
        }
    }

    /// Channel identity.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The owning node.
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Current membership view.
    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Stream ids in order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().cloned().collect()
    }

    /// Whether `stream` exists.
    pub fn has_stream(&self, stream: &StreamId) -> bool {
        self.streams.contains_key(stream)
    }

    /// Whether `node` is in the local membership view.
    pub fn is_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// Drain uncommitted domain events in emission order.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    /// Add a member. Returns false if already present.
    pub fn add_member(&mut self, node: NodeId) -> bool {
        if !self.members.insert(node.clone()) {
            return false;
        }
        self.events.push(DomainEvent::MemberAdded {
            channel: self.channel_id.clone(),
            member: node,
        });
        true
    }

    /// Remove a member. Removing the local node is a programming error.
    pub fn remove_member(&mut self, node: &NodeId) -> Result<bool, ChannelError> {
        if node == &self.local_node {
            return Err(ChannelError::RemoveLocalNode);
        }
        if !self.members.remove(node) {
            return Ok(false);
        }
        self.events.push(DomainEvent::MemberRemoved {
            channel: self.channel_id.clone(),
            member: node.clone(),
        });
        Ok(true)
    }

    /// Create a stream. Returns false (no-op) if it already exists.
    pub fn create_stream(&mut self, stream: StreamId, policy: RetentionPolicy) -> bool {
        if self.streams.contains_key(&stream) {
            return false;
        }
        self.streams.insert(stream.clone(), policy);
        self.events.push(DomainEvent::StreamCreated {
            channel: self.channel_id.clone(),
            stream,
        });
        true
    }

    /// Local write: assign the next per-author sequence and append.
    pub fn append_entry(
        &mut self,
        stream: &StreamId,
        payload: Vec<u8>,
        hlc: Hlc,
        repo: &mut dyn EntryRepository,
    ) -> Result<LogEntry, ChannelError> {
        if !self.streams.contains_key(stream) {
            return Err(ChannelError::StreamNotFound);
        }
        let sequence = repo.latest_sequence(&self.channel_id, stream, &self.local_node) + 1;
        let entry = LogEntry {
            author: self.local_node.clone(),
            sequence,
            timestamp: hlc,
            payload,
        };
        repo.append(&self.channel_id, stream, entry.clone())?;
        self.events.push(DomainEvent::EntryAppended {
            channel: self.channel_id.clone(),
            stream: stream.clone(),
            entry: entry.clone(),
        });
        Ok(entry)
    }

    /// Merge a batch of remote entries into `stream`.
    ///
    /// Entries are partitioned into duplicates, rejected (at or below the
    /// delivery floor but no longer stored), ready (next in the author's
    /// sequence), and out-of-order (parked until the gap fills). Each
    /// delivery re-scans the author's buffer so a filled gap releases
    /// everything behind it. With membership enforcement on, entries from
    /// non-member authors are rejected up front and reported once per
    /// author.
    pub fn merge_entries(
        &mut self,
        stream: &StreamId,
        entries: Vec<LogEntry>,
        repo: &mut dyn EntryRepository,
    ) -> Result<MergeResult, ChannelError> {
        if !self.streams.contains_key(stream) {
            return Err(ChannelError::StreamNotFound);
        }

        let mut result = MergeResult::default();
        let mut batch = entries;
        batch.sort_by(|a, b| {
            a.author
                .cmp(&b.author)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        let mut non_member_authors: BTreeSet<NodeId> = BTreeSet::new();
        for entry in batch {
            if self.reject_non_members && !self.members.contains(&entry.author) {
                result.rejected += 1;
                non_member_authors.insert(entry.author.clone());
                continue;
            }
            if entry.sequence == 0 {
                result.rejected += 1;
                continue;
            }
            let latest = repo.latest_sequence(&self.channel_id, stream, &entry.author);
            if entry.sequence <= latest {
                if repo.contains(&self.channel_id, stream, &entry.id()) {
                    result.duplicates += 1;
                } else {
                    result.rejected += 1;
                }
                continue;
            }
            if entry.sequence == latest + 1 {
                self.deliver(stream, entry, repo, &mut result)?;
            } else {
                self.park(stream, entry, &mut result);
            }
        }

        for author in non_member_authors {
            self.events.push(DomainEvent::NonMemberEntriesRejected {
                channel: self.channel_id.clone(),
                stream: stream.clone(),
                author,
            });
        }

        result.new_version = repo.version_vector(&self.channel_id, stream);
        if !result.new_entries.is_empty() {
            self.events.push(DomainEvent::EntriesMerged {
                channel: self.channel_id.clone(),
                stream: stream.clone(),
                new_entries: result.new_entries.clone(),
                new_version: result.new_version.clone(),
            });
        }
        Ok(result)
    }

    /// Append one ready entry, then release buffered successors.
    fn deliver(
        &mut self,
        stream: &StreamId,
        entry: LogEntry,
        repo: &mut dyn EntryRepository,
        result: &mut MergeResult,
    ) -> Result<(), ChannelError> {
        let author = entry.author.clone();
        repo.append(&self.channel_id, stream, entry.clone())?;
        result.new_entries.push(entry);

        let key = (stream.clone(), author.clone());
        if let Some(buffer) = self.buffers.get_mut(&key) {
            loop {
                let latest = repo.latest_sequence(&self.channel_id, stream, &author);
                let Some(next_seq) = buffer.front().map(|e| e.sequence) else {
                    break;
                };
                if next_seq <= latest {
                    // Stale while parked (another path delivered it).
                    buffer.pop_front();
                    self.buffered_total -= 1;
                } else if next_seq == latest + 1 {
                    if let Some(released) = buffer.pop_front() {
                        self.buffered_total -= 1;
                        repo.append(&self.channel_id, stream, released.clone())?;
                        result.new_entries.push(released);
                    }
                } else {
                    break;
                }
            }
            if buffer.is_empty() {
                self.buffers.remove(&key);
            }
        }
        Ok(())
    }

    /// Park an out-of-order entry in its author's buffer, enforcing caps.
    fn park(&mut self, stream: &StreamId, entry: LogEntry, result: &mut MergeResult) {
        let key = (stream.clone(), entry.author.clone());
        let buffer = self.buffers.entry(key.clone()).or_default();

        let pos = buffer.partition_point(|e| e.sequence < entry.sequence);
        if buffer.get(pos).map(|e| e.sequence) == Some(entry.sequence) {
            // Same gap received twice while open.
            result.duplicates += 1;
            return;
        }
        buffer.insert(pos, entry);
        self.buffered_total += 1;
        result.out_of_order += 1;

        let mut dropped = 0;
        while buffer.len() > self.limits.per_author {
            buffer.pop_front();
            self.buffered_total -= 1;
            dropped += 1;
        }
        if self.buffered_total > self.limits.total {
            let over = self.buffered_total - self.limits.total;
            if let Some(buffer) = self.buffers.get_mut(&key) {
                let n = over.min(buffer.len());
                for _ in 0..n {
                    buffer.pop_front();
                }
                self.buffered_total -= n;
                dropped += n;
            }
        }
        if dropped > 0 {
            result.dropped += dropped;
            let author = key.1.clone();
            debug!(channel = %self.channel_id, stream = %stream, author = %author, dropped, "out-of-order buffer overflow");
            self.events.push(DomainEvent::BufferOverflowOccurred {
                channel: self.channel_id.clone(),
                stream: stream.clone(),
                author,
                dropped,
            });
        }
        let key_empty = self
            .buffers
            .get(&key)
            .map(|b| b.is_empty())
            .unwrap_or(false);
        if key_empty {
            self.buffers.remove(&key);
        }
    }

    /// Entries currently parked across all streams of this channel.
    pub fn buffered_entry_count(&self) -> usize {
        self.buffered_total
    }

    /// Version-vector summary of every stream.
    pub fn compute_digest(&self, repo: &dyn EntryRepository) -> ChannelDigest {
        let streams = self
            .streams
            .keys()
            .map(|stream_id| StreamDigest {
                stream_id: stream_id.clone(),
                version: repo.version_vector(&self.channel_id, stream_id),
            })
            .collect();
        ChannelDigest {
            channel_id: self.channel_id.clone(),
            streams,
        }
    }

    /// Entries a peer at `since` is missing.
    pub fn compute_delta(
        &self,
        stream: &StreamId,
        since: &VersionVector,
        repo: &dyn EntryRepository,
    ) -> Result<ChannelDelta, ChannelError> {
        if !self.streams.contains_key(stream) {
            return Err(ChannelError::StreamNotFound);
        }
        Ok(ChannelDelta {
            channel_id: self.channel_id.clone(),
            stream_id: stream.clone(),
            entries: repo.entries_since(&self.channel_id, stream, since),
        })
    }

    /// Register a fold materializer for `stream`.
    ///
    /// Materializers are not persisted; hosts reinstall them after restart.
    pub fn register_materializer<S: Send + 'static>(
        &mut self,
        stream: StreamId,
        init: impl Fn() -> S + Send + 'static,
        fold: impl Fn(S, &LogEntry) -> S + Send + 'static,
    ) {
        self.register_materializer_boxed(
            stream,
            Box::new(move || Box::new(init()) as BoxedState),
            Box::new(move |state, entry| {
                let state = *state
                    .downcast::<S>()
                    .unwrap_or_else(|_| panic!("materializer state type mismatch"));
                Box::new(fold(state, entry)) as BoxedState
            }),
        );
    }

    /// Type-erased registration path (used by the coordinator handle, which
    /// cannot carry generics across its command channel).
    pub fn register_materializer_boxed(
        &mut self,
        stream: StreamId,
        init: Box<dyn Fn() -> BoxedState + Send>,
        fold: Box<dyn Fn(BoxedState, &LogEntry) -> BoxedState + Send>,
    ) {
        self.materializers.insert(stream, Materializer { init, fold });
    }

    /// Fold all entries of `stream` in timestamp order.
    ///
    /// Panics if `S` differs from the registered state type; that is a
    /// programming error, not a runtime condition.
    pub fn get_state<S: 'static>(
        &self,
        stream: &StreamId,
        repo: &dyn EntryRepository,
    ) -> Result<S, ChannelError> {
        let state = self.get_state_boxed(stream, repo)?;
        match state.downcast::<S>() {
            Ok(s) => Ok(*s),
            Err(_) => panic!("materializer state type mismatch for stream {}", stream),
        }
    }

    /// Type-erased fold (see [`Self::get_state`]).
    pub fn get_state_boxed(
        &self,
        stream: &StreamId,
        repo: &dyn EntryRepository,
    ) -> Result<BoxedState, ChannelError> {
        if !self.streams.contains_key(stream) {
            return Err(ChannelError::StreamNotFound);
        }
        let materializer = self
            .materializers
            .get(stream)
            .ok_or(ChannelError::NoMaterializer)?;
        let mut state = (materializer.init)();
        for entry in repo.get_all(&self.channel_id, stream) {
            state = (materializer.fold)(state, &entry);
        }
        Ok(state)
    }

    /// Apply the stream's retention policy and delete what it drops.
    pub fn compact_stream(
        &mut self,
        stream: &StreamId,
        now_ms: u64,
        repo: &mut dyn EntryRepository,
    ) -> Result<CompactionResult, ChannelError> {
        let policy = self
            .streams
            .get(stream)
            .ok_or(ChannelError::StreamNotFound)?
            .clone();
        let all = repo.get_all(&self.channel_id, stream);
        let retained = policy.retain(&all, now_ms);
        let base_version = base_version_of(&retained);

        let keep: BTreeSet<LogEntryId> = retained.iter().map(LogEntry::id).collect();
        let remove: Vec<LogEntryId> = all
            .iter()
            .map(LogEntry::id)
            .filter(|id| !keep.contains(id))
            .collect();
        if remove.is_empty() {
            return Ok(CompactionResult::unchanged(retained.len(), base_version));
        }
        let removed = repo.remove_entries(&self.channel_id, stream, &remove)?;
        self.events.push(DomainEvent::StreamCompacted {
            channel: self.channel_id.clone(),
            stream: stream.clone(),
            removed,
            base_version: base_version.clone(),
        });
        Ok(CompactionResult {
            removed,
            retained: retained.len(),
            base_version,
        })
    }

    /// Mark removal of this channel (repository cleanup is the owner's job).
    pub fn mark_removed(&mut self) {
        self.events.push(DomainEvent::ChannelRemoved {
            channel: self.channel_id.clone(),
        });
    }
}

impl std::fmt::Debug for ChannelAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAggregate")
            .field("channel_id", &self.channel_id)
            .field("local_node", &self.local_node)
            .field("members", &self.members)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("buffered_total", &self.buffered_total)
            .finish()
    }
}
