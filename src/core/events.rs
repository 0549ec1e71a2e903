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

//! Domain events and the recoverable error stream.
//!
//! Both streams are multicast and lossy: late subscribers miss past items,
//! and a lagging subscriber loses the oldest buffered items instead of
//! blocking the core.

use crate::core::types::{ChannelId, LogEntry, NodeId, StreamId, VersionVector};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Reachability status of a peer as tracked by the local registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    /// Responding to probes.
    Reachable,
    /// Missed enough probes to be suspect; still probed every round.
    Suspected,
    /// Missed far more probes; probed only occasionally.
    Unreachable,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Reachable => f.write_str("reachable"),
            PeerStatus::Suspected => f.write_str("suspected"),
            PeerStatus::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Domain events emitted by the channel aggregate, peer registry, and
/// coordinator. Emitted in causal order per aggregate.
#[derive(Clone, Debug)]
pub enum DomainEvent {
    /// A channel came into existence locally.
    ChannelCreated {
        /// The new channel.
        channel: ChannelId,
    },
    /// A channel was removed along with its stored entries.
    ChannelRemoved {
        /// The removed channel.
        channel: ChannelId,
    },
    /// A member was added to a channel's local membership view.
    MemberAdded {
        /// Affected channel.
        channel: ChannelId,
        /// Added member.
        member: NodeId,
    },
    /// A member was removed from a channel's local membership view.
    MemberRemoved {
        /// Affected channel.
        channel: ChannelId,
        /// Removed member.
        member: NodeId,
    },
    /// A stream was created within a channel.
    StreamCreated {
        /// Owning channel.
        channel: ChannelId,
        /// The new stream.
        stream: StreamId,
    },
    /// A local append completed.
    EntryAppended {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// The appended entry.
        entry: LogEntry,
    },
    /// Remote entries were merged into a stream.
    EntriesMerged {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// Entries newly delivered by this merge, in stream order.
        new_entries: Vec<LogEntry>,
        /// Stream version after the merge.
        new_version: VersionVector,
    },
    /// Retention removed entries from a stream.
    StreamCompacted {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// Number of entries removed.
        removed: usize,
        /// Per-author maximum sequence among retained entries.
        base_version: VersionVector,
    },
    /// An out-of-order buffer hit its cap and dropped entries.
    BufferOverflowOccurred {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// Author whose buffer overflowed.
        author: NodeId,
        /// Number of buffered entries dropped (oldest first).
        dropped: usize,
    },
    /// Host-enforced membership policy rejected entries from a non-member.
    NonMemberEntriesRejected {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// The non-member author.
        author: NodeId,
    },
    /// A peer was added to the registry.
    PeerAdded {
        /// The new peer.
        peer: NodeId,
    },
    /// A peer was removed from the registry.
    PeerRemoved {
        /// The removed peer.
        peer: NodeId,
    },
    /// A peer's reachability status changed.
    PeerStatusChanged {
        /// Affected peer.
        peer: NodeId,
        /// Previous status.
        old_status: PeerStatus,
        /// New status.
        new_status: PeerStatus,
    },
    /// A registry mutation targeted an unknown peer and was skipped.
    PeerOperationSkipped {
        /// The unknown peer.
        peer: NodeId,
        /// Name of the skipped operation.
        operation: &'static str,
    },
}

/// Classification of peer-level sync failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSyncErrorKind {
    /// Transport could not deliver to the peer.
    PeerUnreachable,
    /// Bytes from the peer failed to decode.
    MessageCorrupted,
    /// The peer did not answer within the adaptive deadline.
    PeerTimeout,
}

impl fmt::Display for PeerSyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerSyncErrorKind::PeerUnreachable => f.write_str("peer unreachable"),
            PeerSyncErrorKind::MessageCorrupted => f.write_str("message corrupted"),
            PeerSyncErrorKind::PeerTimeout => f.write_str("peer timeout"),
        }
    }
}

/// Classification of channel-level sync failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelSyncErrorKind {
    /// The channel is not known locally.
    ChannelNotFound,
    /// The stream is not known locally.
    StreamNotFound,
    /// A protocol message referenced state inconsistently.
    ProtocolError,
}

impl fmt::Display for ChannelSyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSyncErrorKind::ChannelNotFound => f.write_str("channel not found"),
            ChannelSyncErrorKind::StreamNotFound => f.write_str("stream not found"),
            ChannelSyncErrorKind::ProtocolError => f.write_str("protocol error"),
        }
    }
}

/// Classification of storage failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageSyncErrorKind {
    /// The backing store failed.
    StorageFailure,
    /// A single entry could not be stored.
    EntryStorageError,
}

impl fmt::Display for StorageSyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageSyncErrorKind::StorageFailure => f.write_str("storage failure"),
            StorageSyncErrorKind::EntryStorageError => f.write_str("entry storage error"),
        }
    }
}

/// Recoverable failures, reported on the error stream. The coordinator keeps
/// running after any of these.
#[derive(Clone, Debug, Error)]
pub enum SyncError {
    /// A peer-level protocol failure.
    #[error("peer {peer}: {kind}: {detail}")]
    PeerSync {
        /// Affected peer.
        peer: NodeId,
        /// Failure classification.
        kind: PeerSyncErrorKind,
        /// Human-readable cause.
        detail: String,
    },
    /// A channel-level protocol failure.
    #[error("channel {channel}: {kind}: {detail}")]
    ChannelSync {
        /// Affected channel.
        channel: ChannelId,
        /// Failure classification.
        kind: ChannelSyncErrorKind,
        /// Human-readable cause.
        detail: String,
    },
    /// A repository failure.
    #[error("storage: {kind}: {detail}")]
    StorageSync {
        /// Failure classification.
        kind: StorageSyncErrorKind,
        /// Human-readable cause.
        detail: String,
    },
    /// A state materializer failed while folding.
    #[error("transform on {channel}/{stream}: {detail}")]
    TransformSync {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// Human-readable cause.
        detail: String,
    },
    /// An out-of-order buffer dropped entries.
    #[error("buffer overflow on {channel}/{stream} for {author}: dropped {dropped}")]
    BufferOverflow {
        /// Owning channel.
        channel: ChannelId,
        /// Owning stream.
        stream: StreamId,
        /// Author whose buffer overflowed.
        author: NodeId,
        /// Number of entries dropped.
        dropped: usize,
    },
}

/// Bounded multicast fan-out for domain events and recoverable errors.
///
/// Built on `tokio::sync::broadcast`: late subscribers miss past items and
/// slow subscribers lose the oldest buffered items rather than blocking the
/// core. Dropping the bus closes both streams.
#[derive(Clone, Debug)]
pub struct EventBus {
    events: broadcast::Sender<DomainEvent>,
    errors: broadcast::Sender<SyncError>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` items per stream.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (errors, _) = broadcast::channel(capacity.max(1));
        Self { events, errors }
    }

    /// Subscribe to domain events from this point on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Subscribe to recoverable errors from this point on.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncError> {
        self.errors.subscribe()
    }

    /// Publish a domain event. A send error only means nobody is listening.
    pub fn publish(&self, event: DomainEvent) {
        debug!(?event, "domain event");
        let _ = self.events.send(event);
    }

    /// Report a recoverable error.
    pub fn report(&self, error: SyncError) {
        warn!(%error, "sync error");
        let _ = self.errors.send(error);
    }
}
