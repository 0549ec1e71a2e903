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

//! Deterministic core value objects and canonical encoding helpers.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization")]
    Serialize,
    #[error("deserialization")]
    Deserialize,
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use BTreeMap/BTreeSet).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Cap inside the deserializer to prevent memory bombs via large container lengths.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// Value-object invariant violation. These are programming errors on the
/// local side; on the decode path they reject malformed remote input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidValue {
    /// Identifier is empty.
    #[error("empty identifier")]
    EmptyId,
    /// Sequence numbers start at 1.
    #[error("sequence must be >= 1")]
    ZeroSequence,
    /// HLC physical time must fit in 48 bits.
    #[error("physical time exceeds 48 bits")]
    PhysicalOverflow,
}

/// Maximum HLC physical component (48-bit milliseconds).
pub const MAX_PHYSICAL_MS: u64 = (1 << 48) - 1;

/// Opaque node identity. Non-empty; equality by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Construct a validated node id.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidValue> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidValue::EmptyId);
        }
        Ok(Self(s))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = InvalidValue;
    fn try_from(s: String) -> Result<Self, InvalidValue> {
        NodeId::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> String {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque channel identity. Non-empty; equality by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    /// Construct a validated channel id.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidValue> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidValue::EmptyId);
        }
        Ok(Self(s))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = InvalidValue;
    fn try_from(s: String) -> Result<Self, InvalidValue> {
        ChannelId::new(s)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> String {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque stream identity within a channel. Non-empty; equality by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    /// Construct a validated stream id.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidValue> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidValue::EmptyId);
        }
        Ok(Self(s))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StreamId {
    type Error = InvalidValue;
    fn try_from(s: String) -> Result<Self, InvalidValue> {
        StreamId::new(s)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> String {
        id.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a log entry: author plus per-author sequence (>= 1).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogEntryId {
    /// Authoring node.
    pub author: NodeId,
    /// Per-author sequence, starting at 1.
    pub sequence: u64,
}

impl LogEntryId {
    /// Construct a validated entry id.
    pub fn new(author: NodeId, sequence: u64) -> Result<Self, InvalidValue> {
        if sequence == 0 {
            return Err(InvalidValue::ZeroSequence);
        }
        Ok(Self { author, sequence })
    }
}

impl fmt::Display for LogEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.author, self.sequence)
    }
}

/// Hybrid logical clock timestamp: 48-bit physical milliseconds plus a
/// 16-bit logical counter. Totally ordered by `(physical_ms, logical)`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub struct Hlc {
    /// Physical component in milliseconds since the UNIX epoch.
    pub physical_ms: u64,
    /// Logical counter disambiguating same-millisecond events.
    pub logical: u16,
}

impl Hlc {
    /// Construct a validated timestamp.
    pub fn new(physical_ms: u64, logical: u16) -> Result<Self, InvalidValue> {
        if physical_ms > MAX_PHYSICAL_MS {
            return Err(InvalidValue::PhysicalOverflow);
        }
        Ok(Self {
            physical_ms,
            logical,
        })
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_ms, self.logical)
    }
}

/// One append-only log entry. The payload is opaque bytes; size limits are
/// enforced at the transport boundary, not here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Authoring node.
    pub author: NodeId,
    /// Per-author sequence, starting at 1, gap-free from the author's view.
    pub sequence: u64,
    /// Hybrid logical clock timestamp assigned at append.
    pub timestamp: Hlc,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Construct a validated entry.
    pub fn new(
        author: NodeId,
        sequence: u64,
        timestamp: Hlc,
        payload: Vec<u8>,
    ) -> Result<Self, InvalidValue> {
        if sequence == 0 {
            return Err(InvalidValue::ZeroSequence);
        }
        Ok(Self {
            author,
            sequence,
            timestamp,
            payload,
        })
    }

    /// Identity of this entry.
    pub fn id(&self) -> LogEntryId {
        LogEntryId {
            author: self.author.clone(),
            sequence: self.sequence,
        }
    }

    /// Total order within a stream: `(timestamp, author)` ascending. The
    /// author tiebreak makes the order identical on every node.
    pub fn stream_cmp(a: &LogEntry, b: &LogEntry) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.author.cmp(&b.author))
            .then_with(|| a.sequence.cmp(&b.sequence))
    }
}

/// Finite map from author to highest sequence seen. Absent keys are
/// equivalent to 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<NodeId, u64>);

impl VersionVector {
    /// Empty vector.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sequence recorded for `author` (0 when absent).
    pub fn get(&self, author: &NodeId) -> u64 {
        self.0.get(author).copied().unwrap_or(0)
    }

    /// Record `sequence` for `author`, keeping the maximum seen.
    pub fn set(&mut self, author: NodeId, sequence: u64) {
        let slot = self.0.entry(author).or_insert(0);
        if sequence > *slot {
            *slot = sequence;
        }
    }

    /// Increment `author` by one and return the new value.
    pub fn increment(&mut self, author: &NodeId) -> u64 {
        let slot = self.0.entry(author.clone()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Pairwise-max merge of `other` into `self`.
    pub fn merge(&mut self, other: &VersionVector) {
        for (author, seq) in other.0.iter() {
            self.set(author.clone(), *seq);
        }
    }

    /// Entries where `other` has a strictly higher sequence than `self`,
    /// paired with the higher value.
    pub fn diff(&self, other: &VersionVector) -> Vec<(NodeId, u64)> {
        other
            .0
            .iter()
            .filter(|(author, seq)| **seq > self.get(author))
            .map(|(author, seq)| (author.clone(), *seq))
            .collect()
    }

    /// True when `self` has seen at least every entry `other` has.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(author, seq)| self.get(author) >= *seq)
    }

    /// Iterate over `(author, sequence)` pairs in author order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.0.iter().map(|(a, s)| (a, *s))
    }

    /// Number of tracked authors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no author is tracked.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(NodeId, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        let mut vv = VersionVector::new();
        for (author, seq) in iter {
            vv.set(author, seq);
        }
        vv
    }
}
