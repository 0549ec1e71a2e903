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

//! Persistence contracts and in-memory implementations.
//!
//! Entries are owned exclusively by the entry repository, keyed by
//! `(channel, stream)` and kept in stream order; aggregates only hold
//! indexes. Durable backends are a host concern.

use crate::core::channel::retention::RetentionPolicy;
use crate::core::types::{ChannelId, LogEntry, LogEntryId, NodeId, StreamId, VersionVector};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Repository failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Append-only entry storage per `(channel, stream)`.
///
/// Implementations keep entries sorted by `(timestamp, author)` so reads are
/// deterministic, and maintain an O(1) latest-sequence cache per author.
/// The latest-sequence bookkeeping is monotone: removal (compaction) never
/// lowers it.
pub trait EntryRepository: Send {
    /// Append one entry.
    fn append(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        entry: LogEntry,
    ) -> Result<(), StoreError>;

    /// Append a batch of entries.
    fn append_all(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        entries: Vec<LogEntry>,
    ) -> Result<(), StoreError> {
        for e in entries {
            self.append(channel, stream, e)?;
        }
        Ok(())
    }

    /// All entries in stream order. Unknown streams read as empty.
    fn get_all(&self, channel: &ChannelId, stream: &StreamId) -> Vec<LogEntry>;

    /// Entries whose author is unknown to `since` or whose sequence exceeds
    /// `since[author]`, in stream order.
    fn entries_since(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        since: &VersionVector,
    ) -> Vec<LogEntry>;

    /// Entries by `author` with sequence strictly greater than `after`.
    fn entries_for_author_after(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        author: &NodeId,
        after: u64,
    ) -> Vec<LogEntry>;

    /// Highest sequence delivered for `author` (0 when unknown).
    fn latest_sequence(&self, channel: &ChannelId, stream: &StreamId, author: &NodeId) -> u64;

    /// Number of stored entries.
    fn entry_count(&self, channel: &ChannelId, stream: &StreamId) -> usize;

    /// Total payload bytes stored.
    fn size_bytes(&self, channel: &ChannelId, stream: &StreamId) -> usize;

    /// Version vector of delivered sequences per author.
    fn version_vector(&self, channel: &ChannelId, stream: &StreamId) -> VersionVector;

    /// Whether the entry with `id` is currently stored.
    fn contains(&self, channel: &ChannelId, stream: &StreamId, id: &LogEntryId) -> bool;

    /// Delete specific entries (compaction). Returns how many were removed.
    fn remove_entries(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        ids: &[LogEntryId],
    ) -> Result<usize, StoreError>;

    /// Drop one stream's entries and bookkeeping.
    fn clear_stream(&mut self, channel: &ChannelId, stream: &StreamId) -> Result<(), StoreError>;

    /// Drop every stream of a channel.
    fn clear_channel(&mut self, channel: &ChannelId) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StreamLog {
    /// Sorted by `LogEntry::stream_cmp`.
    entries: Vec<LogEntry>,
    ids: BTreeSet<LogEntryId>,
    /// Latest delivered sequence per author; never decreases.
    latest: BTreeMap<NodeId, u64>,
    payload_bytes: usize,
}

impl StreamLog {
    fn insert_sorted(&mut self, entry: LogEntry) {
        // Re-appending an existing id is a no-op.
        if self.ids.contains(&entry.id()) {
            return;
        }
        let pos = self
            .entries
            .partition_point(|e| LogEntry::stream_cmp(e, &entry) != std::cmp::Ordering::Greater);
        self.payload_bytes += entry.payload.len();
        self.ids.insert(entry.id());
        let slot = self.latest.entry(entry.author.clone()).or_insert(0);
        if entry.sequence > *slot {
            *slot = entry.sequence;
        }
        self.entries.insert(pos, entry);
    }
}

/// In-memory entry repository. Sufficient for tests and embedded hosts;
/// shared use requires external serialization.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    streams: BTreeMap<(ChannelId, StreamId), StreamLog>,
}

impl InMemoryEntryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, channel: &ChannelId, stream: &StreamId) -> Option<&StreamLog> {
        self.streams.get(&(channel.clone(), stream.clone()))
    }
}

impl EntryRepository for InMemoryEntryStore {
    fn append(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        entry: LogEntry,
    ) -> Result<(), StoreError> {
        self.streams
            .entry((channel.clone(), stream.clone()))
            .or_default()
            .insert_sorted(entry);
        Ok(())
    }

    fn get_all(&self, channel: &ChannelId, stream: &StreamId) -> Vec<LogEntry> {
        self.log(channel, stream)
            .map(|l| l.entries.clone())
            .unwrap_or_default()
    }

    fn entries_since(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        since: &VersionVector,
    ) -> Vec<LogEntry> {
        self.log(channel, stream)
            .map(|l| {
                l.entries
                    .iter()
                    .filter(|e| e.sequence > since.get(&e.author))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn entries_for_author_after(
        &self,
        channel: &ChannelId,
        stream: &StreamId,
        author: &NodeId,
        after: u64,
    ) -> Vec<LogEntry> {
        self.log(channel, stream)
            .map(|l| {
                l.entries
                    .iter()
                    .filter(|e| &e.author == author && e.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn latest_sequence(&self, channel: &ChannelId, stream: &StreamId, author: &NodeId) -> u64 {
        self.log(channel, stream)
            .and_then(|l| l.latest.get(author).copied())
            .unwrap_or(0)
    }

    fn entry_count(&self, channel: &ChannelId, stream: &StreamId) -> usize {
        self.log(channel, stream).map(|l| l.entries.len()).unwrap_or(0)
    }

    fn size_bytes(&self, channel: &ChannelId, stream: &StreamId) -> usize {
        self.log(channel, stream)
            .map(|l| l.payload_bytes)
            .unwrap_or(0)
    }

    fn version_vector(&self, channel: &ChannelId, stream: &StreamId) -> VersionVector {
        self.log(channel, stream)
            .map(|l| l.latest.iter().map(|(a, s)| (a.clone(), *s)).collect())
            .unwrap_or_default()
    }

    fn contains(&self, channel: &ChannelId, stream: &StreamId, id: &LogEntryId) -> bool {
        self.log(channel, stream)
            .map(|l| l.ids.contains(id))
            .unwrap_or(false)
    }

    fn remove_entries(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        ids: &[LogEntryId],
    ) -> Result<usize, StoreError> {
        let Some(log) = self.streams.get_mut(&(channel.clone(), stream.clone())) else {
            return Ok(0);
        };
        let drop: BTreeSet<&LogEntryId> = ids.iter().collect();
        let StreamLog {
            entries,
            ids: stored_ids,
            payload_bytes,
            ..
        } = log;
        let before = entries.len();
        entries.retain(|e| {
            let id = e.id();
            if drop.contains(&id) {
                stored_ids.remove(&id);
                *payload_bytes -= e.payload.len();
                false
            } else {
                true
            }
        });
        Ok(before - entries.len())
    }

    fn clear_stream(&mut self, channel: &ChannelId, stream: &StreamId) -> Result<(), StoreError> {
        self.streams.remove(&(channel.clone(), stream.clone()));
        Ok(())
    }

    fn clear_channel(&mut self, channel: &ChannelId) -> Result<(), StoreError> {
        self.streams.retain(|(c, _), _| c != channel);
        Ok(())
    }
}

/// Persistable view of a channel aggregate. Materializers are deliberately
/// absent; hosts reinstall them after restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Channel identity.
    pub channel_id: ChannelId,
    /// The owning node.
    pub local_node: NodeId,
    /// Local membership view. Always contains `local_node`.
    pub members: BTreeSet<NodeId>,
    /// Streams and their retention policies.
    pub streams: BTreeMap<StreamId, RetentionPolicy>,
}

/// Channel persistence.
pub trait ChannelRepository: Send {
    /// Snapshot for `id`, if stored.
    fn find_by_id(&self, id: &ChannelId) -> Option<ChannelSnapshot>;
    /// Insert or replace a snapshot.
    fn save(&mut self, snapshot: ChannelSnapshot) -> Result<(), StoreError>;
    /// Remove a snapshot.
    fn delete(&mut self, id: &ChannelId) -> Result<(), StoreError>;
    /// All stored channel ids.
    fn list_ids(&self) -> Vec<ChannelId>;
    /// Whether `id` is stored.
    fn exists(&self, id: &ChannelId) -> bool;
    /// Number of stored channels.
    fn count(&self) -> usize;
}

/// In-memory channel repository.
#[derive(Debug, Default)]
pub struct InMemoryChannelStore {
    channels: BTreeMap<ChannelId, ChannelSnapshot>,
}

impl InMemoryChannelStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelRepository for InMemoryChannelStore {
    fn find_by_id(&self, id: &ChannelId) -> Option<ChannelSnapshot> {
        self.channels.get(id).cloned()
    }

    fn save(&mut self, snapshot: ChannelSnapshot) -> Result<(), StoreError> {
        self.channels.insert(snapshot.channel_id.clone(), snapshot);
        Ok(())
    }

    fn delete(&mut self, id: &ChannelId) -> Result<(), StoreError> {
        self.channels.remove(id);
        Ok(())
    }

    fn list_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().cloned().collect()
    }

    fn exists(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    fn count(&self) -> usize {
        self.channels.len()
    }
}
