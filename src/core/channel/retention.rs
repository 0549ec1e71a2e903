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

//! Retention policies: pure transforms `(entries, now) -> retained`.
//! Idempotent for a fixed `now`, so repeated compaction is safe.

use crate::core::types::{LogEntry, LogEntryId, NodeId, VersionVector};
use std::collections::{BTreeMap, BTreeSet};

/// What a stream keeps when compacted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never drop anything.
    KeepAll,
    /// Drop entries older than `max_age_ms` at compaction time.
    MaxAge {
        /// Maximum entry age in milliseconds.
        max_age_ms: u64,
    },
    /// Keep only the most recent `count` entries per author.
    MaxPerAuthor {
        /// Entries retained per author.
        count: usize,
    },
    /// Intersection filter: an entry survives only if every component
    /// policy retains it.
    Composite(Vec<RetentionPolicy>),
}

impl RetentionPolicy {
    /// Ids retained out of `entries` (assumed in stream order).
    fn retained_ids(&self, entries: &[LogEntry], now_ms: u64) -> BTreeSet<LogEntryId> {
        match self {
            RetentionPolicy::KeepAll => entries.iter().map(LogEntry::id).collect(),
            RetentionPolicy::MaxAge { max_age_ms } => entries
                .iter()
                .filter(|e| now_ms.saturating_sub(e.timestamp.physical_ms) <= *max_age_ms)
                .map(LogEntry::id)
                .collect(),
            RetentionPolicy::MaxPerAuthor { count } => {
                let mut per_author: BTreeMap<&NodeId, Vec<&LogEntry>> = BTreeMap::new();
                for e in entries {
                    per_author.entry(&e.author).or_default().push(e);
                }
                let mut keep = BTreeSet::new();
                for (_, author_entries) in per_author {
                    let skip = author_entries.len().saturating_sub(*count);
                    for e in author_entries.into_iter().skip(skip) {
                        keep.insert(e.id());
                    }
                }
                keep
            }
            RetentionPolicy::Composite(policies) => {
                let mut keep: BTreeSet<LogEntryId> = entries.iter().map(LogEntry::id).collect();
                for p in policies {
                    let component = p.retained_ids(entries, now_ms);
                    keep.retain(|id| component.contains(id));
                }
                keep
            }
        }
    }

    /// Apply the policy, preserving stream order.
    pub fn retain(&self, entries: &[LogEntry], now_ms: u64) -> Vec<LogEntry> {
        let keep = self.retained_ids(entries, now_ms);
        entries
            .iter()
            .filter(|e| keep.contains(&e.id()))
            .cloned()
            .collect()
    }
}

/// Outcome of compacting one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionResult {
    /// Entries deleted from the repository.
    pub removed: usize,
    /// Entries surviving compaction.
    pub retained: usize,
    /// Per-author maximum sequence among retained entries. The repository's
    /// delivery bookkeeping is unaffected; this is the floor below which
    /// history is gone.
    pub base_version: VersionVector,
}

impl CompactionResult {
    /// Result for a compaction that removed nothing.
    pub fn unchanged(retained: usize, base_version: VersionVector) -> Self {
        Self {
            removed: 0,
            retained,
            base_version,
        }
    }
}

/// Per-author maximum sequence among `entries`.
pub fn base_version_of(entries: &[LogEntry]) -> VersionVector {
    let mut vv = VersionVector::new();
    for e in entries {
        vv.set(e.author.clone(), e.sequence);
    }
    vv
}
