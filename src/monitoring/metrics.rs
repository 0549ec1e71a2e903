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

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container. The host scrapes `registry`; no exporter is included.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Reachable peers gauge.
    pub peers_reachable: IntGauge,
    /// Pending delta requests gauge.
    pub pending_delta_requests: IntGauge,

    /// Messages sent to peers.
    pub messages_sent_total: IntCounter,
    /// Messages received from peers.
    pub messages_received_total: IntCounter,
    /// Frames that failed to decode.
    pub decode_failures_total: IntCounter,

    /// Gossip rounds started.
    pub gossip_rounds_total: IntCounter,
    /// Probe rounds started.
    pub probe_rounds_total: IntCounter,

    /// Entries appended locally.
    pub entries_appended_total: IntCounter,
    /// Entries delivered by merges.
    pub entries_merged_total: IntCounter,
    /// Out-of-order buffered entries dropped by cap enforcement.
    pub buffer_dropped_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers_reachable = IntGauge::new("driftsync_peers_reachable", "Reachable peers")
            .map_err(|_| MetricsError::Prom)?;
        let pending_delta_requests = IntGauge::new(
            "driftsync_pending_delta_requests",
            "In-flight delta requests",
        )
        .map_err(|_| MetricsError::Prom)?;

        let messages_sent_total =
            IntCounter::new("driftsync_messages_sent_total", "Messages sent to peers")
                .map_err(|_| MetricsError::Prom)?;
        let messages_received_total = IntCounter::new(
            "driftsync_messages_received_total",
            "Messages received from peers",
        )
        .map_err(|_| MetricsError::Prom)?;
        let decode_failures_total = IntCounter::new(
            "driftsync_decode_failures_total",
            "Frames that failed to decode",
        )
        .map_err(|_| MetricsError::Prom)?;

        let gossip_rounds_total =
            IntCounter::new("driftsync_gossip_rounds_total", "Gossip rounds started")
                .map_err(|_| MetricsError::Prom)?;
        let probe_rounds_total =
            IntCounter::new("driftsync_probe_rounds_total", "Probe rounds started")
                .map_err(|_| MetricsError::Prom)?;

        let entries_appended_total = IntCounter::new(
            "driftsync_entries_appended_total",
            "Entries appended locally",
        )
        .map_err(|_| MetricsError::Prom)?;
        let entries_merged_total = IntCounter::new(
            "driftsync_entries_merged_total",
            "Entries delivered by merges",
        )
        .map_err(|_| MetricsError::Prom)?;
        let buffer_dropped_total = IntCounter::new(
            "driftsync_buffer_dropped_total",
            "Buffered entries dropped by cap enforcement",
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(peers_reachable.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(pending_delta_requests.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(messages_sent_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(messages_received_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(decode_failures_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(gossip_rounds_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(probe_rounds_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(entries_appended_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(entries_merged_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(buffer_dropped_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            peers_reachable,
            pending_delta_requests,
            messages_sent_total,
            messages_received_total,
            decode_failures_total,
            gossip_rounds_total,
            probe_rounds_total,
            entries_appended_total,
            entries_merged_total,
            buffer_dropped_total,
        })
    }
}
