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

//! Driftsync - peer-to-peer, offline-first event-stream synchronization for
//! small device fleets.
//!
//! This crate provides:
//! - Per-channel append-only logs with a deterministic total order (hybrid
//!   logical clocks with author tiebreak)
//! - Anti-entropy gossip (digest/delta exchange) driving convergence
//! - A SWIM failure detector with late-ack handling and a two-tier
//!   suspected/unreachable lifecycle
//! - RTT-adaptive ping, probe, and gossip intervals with backpressure
//! - Transport- and payload-agnostic ports: the host supplies the wire and
//!   the discovery
//!
//! The [`networking::coordinator::Coordinator`] is the entry point: create
//! one per node, hand it the ports, add peers, and append.

/// Core protocol primitives (value objects, clock, channel state, events,
/// ports, persistence contracts).
pub mod core;
/// Observability (prometheus metrics container).
pub mod monitoring;
/// Protocol engines (gossip, SWIM), wire codec, peer registry, coordinator.
pub mod networking;
