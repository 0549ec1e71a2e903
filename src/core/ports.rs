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

//! Ports to the host: time, transport, and optional node-state persistence.
//! The core only ever talks to these traits; concrete transports and stores
//! live with the host.

use crate::core::types::{Hlc, NodeId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Send priority. SWIM traffic is high priority so liveness probes are not
/// starved behind bulk deltas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Failure-detector traffic (ping, ack, ping-req).
    High,
    /// Anti-entropy traffic.
    Normal,
}

/// One received transport datagram.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    /// Transport-authenticated sender.
    pub sender: NodeId,
    /// Raw frame bytes.
    pub bytes: Vec<u8>,
    /// Receive time in milliseconds (time-port domain).
    pub received_at_ms: u64,
}

/// Port failure.
#[derive(Debug, Error)]
pub enum PortError {
    /// The transport could not deliver.
    #[error("send failed: {0}")]
    Send(String),
    /// The frame exceeds the transport limit.
    #[error("message too large")]
    TooLarge,
    /// The port is closed.
    #[error("port closed")]
    Closed,
    /// The backing store failed.
    #[error("store failure: {0}")]
    Store(String),
}

/// Transport port. Best-effort sends; delivery and discovery are host
/// concerns.
#[async_trait]
pub trait MessagePort: Send + Sync {
    /// Queue `bytes` for `to`. Failure means the peer is unreachable right
    /// now; the caller converts it to an error-stream report.
    async fn send(&self, to: &NodeId, bytes: Vec<u8>, priority: Priority)
        -> Result<(), PortError>;

    /// Broadcast stream of incoming messages. Closing the port terminates
    /// the stream.
    fn incoming(&self) -> BoxStream<'static, IncomingMessage>;

    /// Frames queued for `peer` and not yet handed to the wire.
    fn pending_send_count(&self, peer: &NodeId) -> usize;

    /// Frames queued across all peers.
    fn total_pending_send_count(&self) -> usize;
}

/// Cancellation handle for a periodic schedule. Dropping without cancelling
/// leaves the schedule running (overlapping handles are tolerated).
pub struct PeriodicHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl PeriodicHandle {
    /// Wrap a cancellation action.
    pub fn new(cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    /// Stop the periodic callback. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHandle")
            .field("cancelled", &self.cancel.is_none())
            .finish()
    }
}

/// Time port. All physical time and all suspension the core performs goes
/// through here, which is what makes the engine testable under virtual time.
#[async_trait]
pub trait TimePort: Send + Sync {
    /// Monotonic-enough physical time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Complete after `duration`. Adaptive scheduling is built on this.
    async fn delay(&self, duration: Duration);

    /// Invoke `callback` every `interval` until the handle is cancelled.
    fn schedule_periodic(
        &self,
        interval: Duration,
        callback: Box<dyn FnMut() + Send>,
    ) -> PeriodicHandle;
}

/// Tokio-backed time port. Under `tokio::time::pause` the clock is virtual,
/// which the integration tests rely on.
#[derive(Debug)]
pub struct TokioTimePort {
    epoch_ms: u64,
    started: tokio::time::Instant,
}

impl TokioTimePort {
    /// Time port whose `now_ms` starts at `epoch_ms`.
    pub fn with_epoch_ms(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            started: tokio::time::Instant::now(),
        }
    }

    /// Time port anchored to the current wall clock.
    pub fn wall() -> Self {
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::with_epoch_ms(epoch_ms)
    }
}

#[async_trait]
impl TimePort for TokioTimePort {
    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.started.elapsed().as_millis() as u64
    }

    async fn delay(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn schedule_periodic(
        &self,
        interval: Duration,
        mut callback: Box<dyn FnMut() + Send>,
    ) -> PeriodicHandle {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of tokio's interval fires immediately; skip it
            // so the first callback lands one interval from now.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback();
            }
        });
        PeriodicHandle::new(Box::new(move || handle.abort()))
    }
}

/// Optional node-local persistence for the HLC and SWIM incarnation. When
/// absent, the clock and incarnation reset on restart.
pub trait NodeStateStore: Send + Sync {
    /// Load the persisted clock, if any.
    fn load_clock(&self) -> Result<Option<Hlc>, PortError>;
    /// Persist the clock.
    fn save_clock(&self, clock: Hlc) -> Result<(), PortError>;
    /// Load the persisted incarnation, if any.
    fn load_incarnation(&self) -> Result<Option<u64>, PortError>;
    /// Persist the incarnation.
    fn save_incarnation(&self, incarnation: u64) -> Result<(), PortError>;
}

/// In-memory node-state store, sufficient for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct InMemoryNodeStateStore {
    inner: Mutex<(Option<Hlc>, Option<u64>)>,
}

impl InMemoryNodeStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStateStore for InMemoryNodeStateStore {
    fn load_clock(&self) -> Result<Option<Hlc>, PortError> {
        Ok(self.inner.lock().expect("state store lock").0)
    }

    fn save_clock(&self, clock: Hlc) -> Result<(), PortError> {
        self.inner.lock().expect("state store lock").0 = Some(clock);
        Ok(())
    }

    fn load_incarnation(&self) -> Result<Option<u64>, PortError> {
        Ok(self.inner.lock().expect("state store lock").1)
    }

    fn save_incarnation(&self, incarnation: u64) -> Result<(), PortError> {
        self.inner.lock().expect("state store lock").1 = Some(incarnation);
        Ok(())
    }
}
