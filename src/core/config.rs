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

//! Coordinator configuration.
//!
//! Only policy knobs are configurable. All timing (ping timeout, probe
//! interval, gossip interval) is derived from measured RTT at runtime and is
//! deliberately not exposed here.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read config file.
    #[error("read config")]
    Read,
    /// Cannot parse TOML.
    #[error("parse config")]
    Parse,
    /// A field failed validation.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

fn default_suspicion_threshold() -> u32 {
    5
}
fn default_unreachable_threshold() -> u32 {
    15
}
fn default_unreachable_probe_interval() -> u32 {
    5
}
fn default_startup_grace_period_ms() -> u64 {
    10_000
}
fn default_congestion_threshold() -> usize {
    10
}
fn default_indirect_probe_count() -> usize {
    3
}
fn default_max_buffer_per_author() -> usize {
    100
}
fn default_max_total_buffer_entries() -> usize {
    10_000
}
fn default_pending_request_expiry_ms() -> u64 {
    5_000
}
fn default_max_payload_bytes() -> usize {
    32 * 1024
}
fn default_event_channel_capacity() -> usize {
    256
}

/// Policy knobs for one coordinator.
#[derive(Clone, Debug, Deserialize)]
pub struct CoordinatorConfig {
    /// Failed probes before a reachable peer becomes suspected.
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: u32,
    /// Failed probes before a suspected peer becomes unreachable.
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,
    /// Unreachable peers are probed once every this many rounds.
    #[serde(default = "default_unreachable_probe_interval")]
    pub unreachable_probe_interval: u32,
    /// Newly added peers are not probed for this long.
    #[serde(default = "default_startup_grace_period_ms")]
    pub startup_grace_period_ms: u64,
    /// Gossip rounds are skipped while the transport backlog exceeds this.
    #[serde(default = "default_congestion_threshold")]
    pub congestion_threshold: usize,
    /// Intermediaries asked to ping on a direct-probe timeout.
    #[serde(default = "default_indirect_probe_count")]
    pub indirect_probe_count: usize,
    /// Out-of-order buffer cap per `(stream, author)`.
    #[serde(default = "default_max_buffer_per_author")]
    pub max_buffer_per_author: usize,
    /// Out-of-order buffer cap per channel across streams and authors.
    #[serde(default = "default_max_total_buffer_entries")]
    pub max_total_buffer_entries: usize,
    /// A pending delta request blocks duplicates for this long.
    #[serde(default = "default_pending_request_expiry_ms")]
    pub pending_request_expiry_ms: u64,
    /// Maximum payload accepted for a single append.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Buffer depth of the event and error broadcast streams.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Host-enforced policy: reject merged entries authored by nodes
    /// outside the channel's membership view, reporting them as
    /// `NonMemberEntriesRejected`. The protocol itself never enforces
    /// membership, so this is off by default.
    #[serde(default)]
    pub reject_non_member_entries: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: default_suspicion_threshold(),
            unreachable_threshold: default_unreachable_threshold(),
            unreachable_probe_interval: default_unreachable_probe_interval(),
            startup_grace_period_ms: default_startup_grace_period_ms(),
            congestion_threshold: default_congestion_threshold(),
            indirect_probe_count: default_indirect_probe_count(),
            max_buffer_per_author: default_max_buffer_per_author(),
            max_total_buffer_entries: default_max_total_buffer_entries(),
            pending_request_expiry_ms: default_pending_request_expiry_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            event_channel_capacity: default_event_channel_capacity(),
            reject_non_member_entries: false,
        }
    }
}

impl CoordinatorConfig {
    /// Parse from a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: CoordinatorConfig = toml::from_str(raw).map_err(|_| ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
        Self::from_toml_str(&raw)
    }

    /// Reject inconsistent knob combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.suspicion_threshold == 0 {
            return Err(ConfigError::Invalid("suspicion_threshold must be >= 1"));
        }
        if self.unreachable_threshold <= self.suspicion_threshold {
            return Err(ConfigError::Invalid(
                "unreachable_threshold must exceed suspicion_threshold",
            ));
        }
        if self.unreachable_probe_interval == 0 {
            return Err(ConfigError::Invalid(
                "unreachable_probe_interval must be >= 1",
            ));
        }
        if self.max_buffer_per_author == 0 {
            return Err(ConfigError::Invalid("max_buffer_per_author must be >= 1"));
        }
        if self.max_total_buffer_entries < self.max_buffer_per_author {
            return Err(ConfigError::Invalid(
                "max_total_buffer_entries must be >= max_buffer_per_author",
            ));
        }
        if self.pending_request_expiry_ms == 0 {
            return Err(ConfigError::Invalid(
                "pending_request_expiry_ms must be >= 1",
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("max_payload_bytes must be >= 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid("event_channel_capacity must be >= 1"));
        }
        Ok(())
    }
}
