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

//! Coordinator: single-actor event loop wiring the engines to the ports.
//!
//! All mutable protocol state lives in one spawned task; the public handle
//! talks to it over a command channel, so every external entry point is
//! serialized and synchronous sections between awaits are atomic. Adaptive
//! scheduling re-arms each round through `TimePort::delay` instead of a
//! fixed-period timer.

use crate::core::channel::{
    BoxedState, BufferLimits, ChannelAggregate, CompactionResult, RetentionPolicy,
};
use crate::core::clock::HlcClock;
use crate::core::config::{ConfigError, CoordinatorConfig};
use crate::core::events::{
    DomainEvent, EventBus, PeerSyncErrorKind, StorageSyncErrorKind, SyncError,
};
use crate::core::ports::{
    IncomingMessage, MessagePort, NodeStateStore, PeriodicHandle, TimePort,
};
use crate::core::repository::{ChannelRepository, EntryRepository};
use crate::core::types::{ChannelId, LogEntry, NodeId, StreamId, VersionVector};
use crate::monitoring::Metrics;
use crate::networking::gossip::GossipEngine;
use crate::networking::peer_registry::{PeerRegistry, PeerRepository, RegistryError};
use crate::networking::rtt::{RttTracker, TimingStatus};
use crate::networking::swim::{FailureDetector, SwimAction};
use crate::networking::wire::WireMessage;
use futures::StreamExt;
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// How often persisted node state (clock, incarnation, peers) is flushed.
const PERSIST_INTERVAL_MS: u64 = 5_000;

/// Coordinator lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created or stopped; schedulers idle.
    Stopped,
    /// Schedulers armed, messages processed.
    Running,
    /// Schedulers re-arm but rounds and messages are skipped.
    Paused,
    /// Terminal; all streams closed.
    Disposed,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Stopped => "stopped",
            Lifecycle::Running => "running",
            Lifecycle::Paused => "paused",
            Lifecycle::Disposed => "disposed",
        }
    }
}

/// Invalid lifecycle transitions (programming errors).
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        /// Attempted operation.
        operation: &'static str,
        /// State at the time.
        state: &'static str,
    },
    /// The coordinator has been disposed.
    #[error("coordinator disposed")]
    Disposed,
}

/// Errors returned by handle operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Lifecycle violation.
    #[error("lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),
    /// The channel is unknown.
    #[error("channel not found")]
    ChannelNotFound,
    /// An aggregate operation failed.
    #[error("channel: {0}")]
    Channel(#[from] crate::core::channel::ChannelError),
    /// A registry operation failed.
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    /// A repository operation failed.
    #[error("store: {0}")]
    Store(#[from] crate::core::repository::StoreError),
}

/// Read-only status snapshot.
#[derive(Clone, Copy, Debug)]
pub struct SyncStatus {
    /// Lifecycle state.
    pub lifecycle: Lifecycle,
    /// Known peers.
    pub peer_count: usize,
    /// Peers currently reachable.
    pub reachable_peers: usize,
    /// Non-expired pending delta requests.
    pub pending_delta_requests: usize,
    /// Probe rounds awaiting their round-end cleanup.
    pub pending_probes: usize,
    /// Adaptive timing in effect.
    pub timing: TimingStatus,
}

/// Everything the coordinator consumes from its host.
pub struct CoordinatorPorts {
    /// Transport.
    pub transport: Arc<dyn MessagePort>,
    /// Time source and scheduler.
    pub time: Arc<dyn TimePort>,
    /// Entry storage.
    pub entry_repository: Box<dyn EntryRepository>,
    /// Channel persistence.
    pub channel_repository: Box<dyn ChannelRepository>,
    /// Optional peer persistence (known-peer cache for reconnection).
    pub peer_repository: Option<Box<dyn PeerRepository>>,
    /// Optional clock/incarnation persistence.
    pub state_store: Option<Arc<dyn NodeStateStore>>,
    /// Injected randomness.
    pub rng: Box<dyn RngCore + Send>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start(Reply<Result<(), LifecycleError>>),
    Pause(Reply<Result<(), LifecycleError>>),
    Resume(Reply<Result<(), LifecycleError>>),
    Stop(Reply<Result<(), LifecycleError>>),
    Dispose(Reply<()>),
    CreateChannel(ChannelId, Reply<Result<bool, CoordinatorError>>),
    RemoveChannel(ChannelId, Reply<Result<bool, CoordinatorError>>),
    AddMember(ChannelId, NodeId, Reply<Result<bool, CoordinatorError>>),
    RemoveMember(ChannelId, NodeId, Reply<Result<bool, CoordinatorError>>),
    CreateStream(
        ChannelId,
        StreamId,
        RetentionPolicy,
        Reply<Result<bool, CoordinatorError>>,
    ),
    Append(
        ChannelId,
        StreamId,
        Vec<u8>,
        Reply<Result<LogEntry, CoordinatorError>>,
    ),
    Entries(
        ChannelId,
        StreamId,
        Reply<Result<Vec<LogEntry>, CoordinatorError>>,
    ),
    VersionVectorOf(
        ChannelId,
        StreamId,
        Reply<Result<VersionVector, CoordinatorError>>,
    ),
    CompactStream(
        ChannelId,
        StreamId,
        Reply<Result<CompactionResult, CoordinatorError>>,
    ),
    RegisterMaterializer {
        channel: ChannelId,
        stream: StreamId,
        init: Box<dyn Fn() -> BoxedState + Send>,
        fold: Box<dyn Fn(BoxedState, &LogEntry) -> BoxedState + Send>,
        reply: Reply<Result<(), CoordinatorError>>,
    },
    GetState(
        ChannelId,
        StreamId,
        Reply<Result<BoxedState, CoordinatorError>>,
    ),
    AddPeer(NodeId, Reply<Result<bool, CoordinatorError>>),
    RemovePeer(NodeId, Reply<Result<bool, CoordinatorError>>),
    SubscribeEvents(Reply<broadcast::Receiver<DomainEvent>>),
    SubscribeErrors(Reply<broadcast::Receiver<SyncError>>),
    Status(Reply<SyncStatus>),
}

#[derive(Clone, Copy, Debug)]
enum InternalEvent {
    GossipTick,
    ProbeTick,
    DirectTimeout(u64),
    RoundEnd(u64),
    PersistFlush,
}

/// Handle to a running coordinator actor.
///
/// Created in `Stopped`; `dispose` is terminal and idempotent. Cloning the
/// handle is cheap; all clones address the same actor.
#[derive(Clone)]
pub struct Coordinator {
    local_node: NodeId,
    cmd_tx: mpsc::Sender<Command>,
}

impl Coordinator {
    /// Create a coordinator actor for `local_node` and return its handle in
    /// state `Stopped`.
    pub fn create(
        local_node: NodeId,
        config: CoordinatorConfig,
        ports: CoordinatorPorts,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let bus = EventBus::new(config.event_channel_capacity);
        let limits = BufferLimits {
            per_author: config.max_buffer_per_author,
            total: config.max_total_buffer_entries,
        };
        let actor = Actor {
            state: Lifecycle::Stopped,
            local_node: local_node.clone(),
            limits,
            reject_non_members: config.reject_non_member_entries,
            gossip: GossipEngine::new(
                local_node.clone(),
                config.pending_request_expiry_ms,
                config.congestion_threshold,
                config.max_payload_bytes,
            ),
            swim: FailureDetector::new(local_node.clone(), &config),
            registry: PeerRegistry::new(local_node.clone(), 0),
            clock: HlcClock::new(),
            rtt: RttTracker::new(),
            channels: BTreeMap::new(),
            entry_repo: ports.entry_repository,
            channel_repo: ports.channel_repository,
            peer_repo: ports.peer_repository,
            state_store: ports.state_store,
            transport: ports.transport,
            time: ports.time,
            rng: ports.rng,
            bus,
            metrics,
            internal_tx,
            epoch: 0,
            persist_handle: None,
        };
        tokio::spawn(actor.run(cmd_rx, internal_rx));
        Ok(Self { local_node, cmd_tx })
    }

    /// The node this coordinator serves.
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| LifecycleError::Disposed)?;
        rx.await.map_err(|_| LifecycleError::Disposed.into())
    }

    /// `Stopped -> Running`: arm schedulers and load persisted node state.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Start).await?.map_err(Into::into)
    }

    /// `Running -> Paused`.
    pub async fn pause(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Pause).await?.map_err(Into::into)
    }

    /// `Paused -> Running`.
    pub async fn resume(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Resume).await?.map_err(Into::into)
    }

    /// `Running | Paused -> Stopped`: cancel scheduled work, flush state.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Stop).await?.map_err(Into::into)
    }

    /// Terminal, idempotent. Closes the event and error streams.
    pub async fn dispose(&self) -> Result<(), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Dispose(tx)).await.is_err() {
            // Already disposed.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Create a channel with the local node as sole member. False when it
    /// already existed.
    pub async fn create_channel(&self, channel: ChannelId) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::CreateChannel(channel, r)).await?
    }

    /// Remove a channel and its stored entries. False when unknown.
    pub async fn remove_channel(&self, channel: ChannelId) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::RemoveChannel(channel, r)).await?
    }

    /// Add a member to a channel's local view.
    pub async fn add_member(
        &self,
        channel: ChannelId,
        member: NodeId,
    ) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::AddMember(channel, member, r))
            .await?
    }

    /// Remove a member. Removing the local node fails.
    pub async fn remove_member(
        &self,
        channel: ChannelId,
        member: NodeId,
    ) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::RemoveMember(channel, member, r))
            .await?
    }

    /// Create a stream. False (no-op) when it already existed.
    pub async fn create_stream(
        &self,
        channel: ChannelId,
        stream: StreamId,
        policy: RetentionPolicy,
    ) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::CreateStream(channel, stream, policy, r))
            .await?
    }

    /// Append a local entry.
    pub async fn append(
        &self,
        channel: ChannelId,
        stream: StreamId,
        payload: Vec<u8>,
    ) -> Result<LogEntry, CoordinatorError> {
        self.request(|r| Command::Append(channel, stream, payload, r))
            .await?
    }

    /// All entries of a stream in total order.
    pub async fn entries(
        &self,
        channel: ChannelId,
        stream: StreamId,
    ) -> Result<Vec<LogEntry>, CoordinatorError> {
        self.request(|r| Command::Entries(channel, stream, r)).await?
    }

    /// Current version vector of a stream.
    pub async fn version_vector(
        &self,
        channel: ChannelId,
        stream: StreamId,
    ) -> Result<VersionVector, CoordinatorError> {
        self.request(|r| Command::VersionVectorOf(channel, stream, r))
            .await?
    }

    /// Apply the stream's retention policy now.
    pub async fn compact_stream(
        &self,
        channel: ChannelId,
        stream: StreamId,
    ) -> Result<CompactionResult, CoordinatorError> {
        self.request(|r| Command::CompactStream(channel, stream, r))
            .await?
    }

    /// Register a fold materializer for a stream.
    pub async fn register_materializer<S: Send + 'static>(
        &self,
        channel: ChannelId,
        stream: StreamId,
        init: impl Fn() -> S + Send + 'static,
        fold: impl Fn(S, &LogEntry) -> S + Send + 'static,
    ) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::RegisterMaterializer {
            channel,
            stream,
            init: Box::new(move || Box::new(init()) as BoxedState),
            fold: Box::new(move |state, entry| {
                let state = *state
                    .downcast::<S>()
                    .unwrap_or_else(|_| panic!("materializer state type mismatch"));
                Box::new(fold(state, entry)) as BoxedState
            }),
            reply,
        })
        .await?
    }

    /// Fold the stream into its materialized state.
    ///
    /// Panics if `S` differs from the registered state type (programming
    /// error).
    pub async fn get_state<S: 'static>(
        &self,
        channel: ChannelId,
        stream: StreamId,
    ) -> Result<S, CoordinatorError> {
        let stream_for_panic = stream.clone();
        let boxed = self.request(|r| Command::GetState(channel, stream, r)).await??;
        match boxed.downcast::<S>() {
            Ok(s) => Ok(*s),
            Err(_) => panic!(
                "materializer state type mismatch for stream {}",
                stream_for_panic
            ),
        }
    }

    /// Register a peer for gossip and probing. False when already known
    /// (the peer is revived instead).
    pub async fn add_peer(&self, peer: NodeId) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::AddPeer(peer, r)).await?
    }

    /// Forget a peer. False when unknown.
    pub async fn remove_peer(&self, peer: NodeId) -> Result<bool, CoordinatorError> {
        self.request(|r| Command::RemovePeer(peer, r)).await?
    }

    /// Subscribe to domain events from this point on.
    pub async fn subscribe_events(
        &self,
    ) -> Result<broadcast::Receiver<DomainEvent>, CoordinatorError> {
        self.request(Command::SubscribeEvents).await
    }

    /// Subscribe to recoverable errors from this point on.
    pub async fn subscribe_errors(
        &self,
    ) -> Result<broadcast::Receiver<SyncError>, CoordinatorError> {
        self.request(Command::SubscribeErrors).await
    }

    /// Read-only status snapshot.
    pub async fn status(&self) -> Result<SyncStatus, CoordinatorError> {
        self.request(Command::Status).await
    }
}

struct Actor {
    state: Lifecycle,
    local_node: NodeId,
    limits: BufferLimits,
    reject_non_members: bool,
    gossip: GossipEngine,
    swim: FailureDetector,
    registry: PeerRegistry,
    clock: HlcClock,
    rtt: RttTracker,
    channels: BTreeMap<ChannelId, ChannelAggregate>,
    entry_repo: Box<dyn EntryRepository>,
    channel_repo: Box<dyn ChannelRepository>,
    peer_repo: Option<Box<dyn PeerRepository>>,
    state_store: Option<Arc<dyn NodeStateStore>>,
    transport: Arc<dyn MessagePort>,
    time: Arc<dyn TimePort>,
    rng: Box<dyn RngCore + Send>,
    bus: EventBus,
    metrics: Arc<Metrics>,
    internal_tx: mpsc::UnboundedSender<(u64, InternalEvent)>,
    epoch: u64,
    persist_handle: Option<PeriodicHandle>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<(u64, InternalEvent)>,
    ) {
        let mut incoming = self.transport.incoming();
        let mut incoming_open = true;
        info!(node = %self.local_node, "coordinator actor started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                    }
                }
                tick = internal_rx.recv() => {
                    if let Some((epoch, ev)) = tick {
                        if epoch == self.epoch {
                            self.handle_internal(ev).await;
                        }
                    }
                }
                msg = incoming.next(), if incoming_open => {
                    match msg {
                        None => {
                            warn!("transport incoming stream closed");
                            incoming_open = false;
                        }
                        Some(msg) => self.handle_incoming(msg).await,
                    }
                }
            }
        }
        info!(node = %self.local_node, "coordinator actor terminated");
    }

    fn schedule(&self, event: InternalEvent, after_ms: u64) {
        let time = Arc::clone(&self.time);
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            time.delay(Duration::from_millis(after_ms)).await;
            let _ = tx.send((epoch, event));
        });
    }

    /// Returns true when the actor should exit (dispose).
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start(reply) => {
                let _ = reply.send(self.do_start());
            }
            Command::Pause(reply) => {
                let result = self.transition("pause", Lifecycle::Running, Lifecycle::Paused);
                if result.is_ok() {
                    // Incoming messages are dropped while paused, so an
                    // in-flight probe can never be answered; forget it
                    // rather than letting its round-end timer count a
                    // phantom failure against a healthy peer.
                    self.swim.clear();
                }
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.transition("resume", Lifecycle::Paused, Lifecycle::Running);
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.do_stop());
            }
            Command::Dispose(reply) => {
                self.do_dispose();
                let _ = reply.send(());
                return true;
            }
            Command::CreateChannel(channel, reply) => {
                let _ = reply.send(self.do_create_channel(channel));
            }
            Command::RemoveChannel(channel, reply) => {
                let _ = reply.send(self.do_remove_channel(&channel));
            }
            Command::AddMember(channel, member, reply) => {
                let result = self.with_channel_mut(&channel, |agg| Ok(agg.add_member(member)));
                self.drain_events();
                let _ = reply.send(result);
                self.save_channel(&channel);
            }
            Command::RemoveMember(channel, member, reply) => {
                let result = self
                    .with_channel_mut(&channel, |agg| agg.remove_member(&member).map_err(Into::into));
                self.drain_events();
                let _ = reply.send(result);
                self.save_channel(&channel);
            }
            Command::CreateStream(channel, stream, policy, reply) => {
                let result =
                    self.with_channel_mut(&channel, |agg| Ok(agg.create_stream(stream, policy)));
                self.drain_events();
                let _ = reply.send(result);
                self.save_channel(&channel);
            }
            Command::Append(channel, stream, payload, reply) => {
                let _ = reply.send(self.do_append(&channel, &stream, payload));
            }
            Command::Entries(channel, stream, reply) => {
                let result = if self.channels.contains_key(&channel) {
                    Ok(self.entry_repo.get_all(&channel, &stream))
                } else {
                    Err(CoordinatorError::ChannelNotFound)
                };
                let _ = reply.send(result);
            }
            Command::VersionVectorOf(channel, stream, reply) => {
                let result = if self.channels.contains_key(&channel) {
                    Ok(self.entry_repo.version_vector(&channel, &stream))
                } else {
                    Err(CoordinatorError::ChannelNotFound)
                };
                let _ = reply.send(result);
            }
            Command::CompactStream(channel, stream, reply) => {
                let now = self.time.now_ms();
                let result = match self.channels.get_mut(&channel) {
                    None => Err(CoordinatorError::ChannelNotFound),
                    Some(agg) => agg
                        .compact_stream(&stream, now, self.entry_repo.as_mut())
                        .map_err(Into::into),
                };
                self.drain_events();
                let _ = reply.send(result);
            }
            Command::RegisterMaterializer {
                channel,
                stream,
                init,
                fold,
                reply,
            } => {
                let result = match self.channels.get_mut(&channel) {
                    None => Err(CoordinatorError::ChannelNotFound),
                    Some(agg) => {
                        agg.register_materializer_boxed(stream, init, fold);
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::GetState(channel, stream, reply) => {
                let result = match self.channels.get(&channel) {
                    None => Err(CoordinatorError::ChannelNotFound),
                    Some(agg) => agg
                        .get_state_boxed(&stream, self.entry_repo.as_ref())
                        .map_err(Into::into),
                };
                let _ = reply.send(result);
            }
            Command::AddPeer(peer, reply) => {
                let now = self.time.now_ms();
                let result = self.registry.add_peer(peer.clone(), now).map_err(Into::into);
                if result.is_ok() {
                    self.save_peer(&peer);
                }
                self.drain_events();
                let _ = reply.send(result);
            }
            Command::RemovePeer(peer, reply) => {
                let removed = self.registry.remove_peer(&peer);
                if let Some(repo) = self.peer_repo.as_mut() {
                    repo.delete(&peer);
                }
                self.drain_events();
                let _ = reply.send(Ok(removed));
            }
            Command::SubscribeEvents(reply) => {
                let _ = reply.send(self.bus.subscribe_events());
            }
            Command::SubscribeErrors(reply) => {
                let _ = reply.send(self.bus.subscribe_errors());
            }
            Command::Status(reply) => {
                let now = self.time.now_ms();
                let _ = reply.send(SyncStatus {
                    lifecycle: self.state,
                    peer_count: self.registry.peer_count(),
                    reachable_peers: self.registry.reachable_peers().len(),
                    pending_delta_requests: self.gossip.pending_request_count(now),
                    pending_probes: self.swim.pending_probe_count(),
                    timing: self.rtt.status(),
                });
            }
        }
        false
    }

    fn transition(
        &mut self,
        operation: &'static str,
        from: Lifecycle,
        to: Lifecycle,
    ) -> Result<(), LifecycleError> {
        if self.state != from {
            return Err(LifecycleError::InvalidTransition {
                operation,
                state: self.state.name(),
            });
        }
        info!(node = %self.local_node, from = from.name(), to = to.name(), "lifecycle transition");
        self.state = to;
        Ok(())
    }

    fn do_start(&mut self) -> Result<(), LifecycleError> {
        if self.state != Lifecycle::Stopped {
            return Err(LifecycleError::InvalidTransition {
                operation: "start",
                state: self.state.name(),
            });
        }
        self.epoch += 1;
        self.load_persisted_state();

        self.schedule(InternalEvent::GossipTick, self.rtt.gossip_interval());
        self.schedule(InternalEvent::ProbeTick, self.rtt.probe_interval());

        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        self.persist_handle = Some(self.time.schedule_periodic(
            Duration::from_millis(PERSIST_INTERVAL_MS),
            Box::new(move || {
                let _ = tx.send((epoch, InternalEvent::PersistFlush));
            }),
        ));

        info!(node = %self.local_node, "coordinator started");
        self.state = Lifecycle::Running;
        Ok(())
    }

    fn do_stop(&mut self) -> Result<(), LifecycleError> {
        if self.state != Lifecycle::Running && self.state != Lifecycle::Paused {
            return Err(LifecycleError::InvalidTransition {
                operation: "stop",
                state: self.state.name(),
            });
        }
        self.epoch += 1;
        if let Some(mut handle) = self.persist_handle.take() {
            handle.cancel();
        }
        self.flush_persisted_state();
        self.gossip.clear();
        self.swim.clear();
        info!(node = %self.local_node, "coordinator stopped");
        self.state = Lifecycle::Stopped;
        Ok(())
    }

    fn do_dispose(&mut self) {
        if self.state == Lifecycle::Disposed {
            return;
        }
        self.epoch += 1;
        if let Some(mut handle) = self.persist_handle.take() {
            handle.cancel();
        }
        self.flush_persisted_state();
        self.gossip.clear();
        self.swim.clear();
        info!(node = %self.local_node, "coordinator disposed");
        self.state = Lifecycle::Disposed;
    }

    fn load_persisted_state(&mut self) {
        if let Some(store) = self.state_store.as_ref() {
            match store.load_clock() {
                Ok(Some(hlc)) => {
                    if hlc > self.clock.current() {
                        self.clock = HlcClock::from_persisted(hlc);
                    }
                }
                Ok(None) => {}
                Err(e) => self.bus.report(SyncError::StorageSync {
                    kind: StorageSyncErrorKind::StorageFailure,
                    detail: e.to_string(),
                }),
            }
            match store.load_incarnation() {
                Ok(Some(inc)) => self.registry.adopt_local_incarnation(inc),
                Ok(None) => {}
                Err(e) => self.bus.report(SyncError::StorageSync {
                    kind: StorageSyncErrorKind::StorageFailure,
                    detail: e.to_string(),
                }),
            }
        }
        for id in self.channel_repo.list_ids() {
            if self.channels.contains_key(&id) {
                continue;
            }
            if let Some(snapshot) = self.channel_repo.find_by_id(&id) {
                let mut aggregate = ChannelAggregate::from_snapshot(snapshot, self.limits);
                aggregate.set_membership_enforcement(self.reject_non_members);
                self.channels.insert(id, aggregate);
            }
        }
        // The known-peer cache drives the host-visible reconnection path:
        // every persisted peer is re-added as reachable.
        let now = self.time.now_ms();
        if let Some(repo) = self.peer_repo.as_ref() {
            for peer in repo.find_all() {
                let _ = self.registry.add_peer(peer.id, now);
            }
        }
        self.drain_events();
    }

    fn flush_persisted_state(&mut self) {
        if let Some(store) = self.state_store.as_ref() {
            if let Err(e) = store.save_clock(self.clock.current()) {
                self.bus.report(SyncError::StorageSync {
                    kind: StorageSyncErrorKind::StorageFailure,
                    detail: e.to_string(),
                });
            }
            if let Err(e) = store.save_incarnation(self.registry.local_incarnation()) {
                self.bus.report(SyncError::StorageSync {
                    kind: StorageSyncErrorKind::StorageFailure,
                    detail: e.to_string(),
                });
            }
        }
        if let Some(repo) = self.peer_repo.as_mut() {
            for peer in self.registry.all_peers() {
                repo.save(peer.clone());
            }
        }
    }

    fn do_create_channel(&mut self, channel: ChannelId) -> Result<bool, CoordinatorError> {
        if self.channels.contains_key(&channel) {
            return Ok(false);
        }
        let mut aggregate =
            ChannelAggregate::new(channel.clone(), self.local_node.clone(), self.limits);
        aggregate.set_membership_enforcement(self.reject_non_members);
        self.channel_repo.save(aggregate.snapshot())?;
        self.channels.insert(channel, aggregate);
        self.drain_events();
        Ok(true)
    }

    fn do_remove_channel(&mut self, channel: &ChannelId) -> Result<bool, CoordinatorError> {
        let Some(mut aggregate) = self.channels.remove(channel) else {
            return Ok(false);
        };
        aggregate.mark_removed();
        self.entry_repo.clear_channel(channel)?;
        self.channel_repo.delete(channel)?;
        self.publish_events(aggregate.take_events());
        Ok(true)
    }

    fn do_append(
        &mut self,
        channel: &ChannelId,
        stream: &StreamId,
        payload: Vec<u8>,
    ) -> Result<LogEntry, CoordinatorError> {
        let now = self.time.now_ms();
        let Some(aggregate) = self.channels.get_mut(channel) else {
            return Err(CoordinatorError::ChannelNotFound);
        };
        let hlc = self.clock.now(now);
        let entry = aggregate.append_entry(stream, payload, hlc, self.entry_repo.as_mut())?;
        self.metrics.entries_appended_total.inc();
        self.drain_events();
        Ok(entry)
    }

    fn with_channel_mut<T>(
        &mut self,
        channel: &ChannelId,
        f: impl FnOnce(&mut ChannelAggregate) -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        match self.channels.get_mut(channel) {
            None => Err(CoordinatorError::ChannelNotFound),
            Some(agg) => f(agg),
        }
    }

    fn save_channel(&mut self, channel: &ChannelId) {
        if let Some(agg) = self.channels.get(channel) {
            if let Err(e) = self.channel_repo.save(agg.snapshot()) {
                self.bus.report(SyncError::StorageSync {
                    kind: StorageSyncErrorKind::StorageFailure,
                    detail: e.to_string(),
                });
            }
        }
    }

    fn save_peer(&mut self, peer: &NodeId) {
        if let (Some(repo), Some(p)) = (self.peer_repo.as_mut(), self.registry.get(peer)) {
            repo.save(p.clone());
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::GossipTick => {
                if self.state == Lifecycle::Running {
                    self.run_gossip_round().await;
                }
                self.schedule(InternalEvent::GossipTick, self.rtt.gossip_interval());
            }
            InternalEvent::ProbeTick => {
                if self.state == Lifecycle::Running {
                    self.run_probe_round().await;
                }
                self.schedule(InternalEvent::ProbeTick, self.rtt.probe_interval());
            }
            InternalEvent::DirectTimeout(sequence) => {
                if self.state == Lifecycle::Running {
                    let actions =
                        self.swim
                            .handle_direct_timeout(sequence, &self.registry, self.rng.as_mut());
                    self.execute_swim_actions(actions).await;
                }
            }
            InternalEvent::RoundEnd(sequence) => {
                if self.state != Lifecycle::Disposed {
                    self.swim.handle_round_end(sequence, &mut self.registry);
                    self.drain_events();
                }
            }
            InternalEvent::PersistFlush => {
                self.flush_persisted_state();
            }
        }
    }

    async fn run_gossip_round(&mut self) {
        self.metrics.gossip_rounds_total.inc();
        let now = self.time.now_ms();
        let backlog = self.transport.total_pending_send_count();
        let round = self.gossip.start_round(
            backlog,
            &self.channels,
            self.entry_repo.as_ref(),
            &self.registry,
            self.rng.as_mut(),
        );
        if let Some((peer, message)) = round {
            self.registry.update_anti_entropy(&peer, now);
            self.send_message(&peer, message).await;
        }
        self.drain_events();
    }

    async fn run_probe_round(&mut self) {
        self.metrics.probe_rounds_total.inc();
        let now = self.time.now_ms();
        let actions =
            self.swim
                .start_probe_round(now, &mut self.registry, &self.rtt, self.rng.as_mut());
        self.execute_swim_actions(actions).await;
        self.drain_events();
    }

    async fn execute_swim_actions(&mut self, actions: Vec<SwimAction>) {
        for action in actions {
            match action {
                SwimAction::Send { to, message } => {
                    self.send_message(&to, message).await;
                }
                SwimAction::ScheduleDirectTimeout { sequence, after_ms } => {
                    self.schedule(InternalEvent::DirectTimeout(sequence), after_ms);
                }
                SwimAction::ScheduleRoundEnd { sequence, after_ms } => {
                    self.schedule(InternalEvent::RoundEnd(sequence), after_ms);
                }
            }
        }
    }

    async fn send_message(&mut self, to: &NodeId, message: WireMessage) {
        let bytes = match message.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(peer = %to, err = %e, "failed to encode outgoing message");
                return;
            }
        };
        let priority = message.priority();
        let len = bytes.len();
        match self.transport.send(to, bytes, priority).await {
            Ok(()) => {
                let now = self.time.now_ms();
                self.registry.record_message_sent(to, len, now);
                self.metrics.messages_sent_total.inc();
            }
            Err(e) => {
                self.bus.report(SyncError::PeerSync {
                    peer: to.clone(),
                    kind: PeerSyncErrorKind::PeerUnreachable,
                    detail: e.to_string(),
                });
            }
        }
        self.drain_events();
    }

    async fn handle_incoming(&mut self, incoming: IncomingMessage) {
        if self.state != Lifecycle::Running {
            debug!(sender = %incoming.sender, "message dropped: coordinator not running");
            return;
        }
        let now = self.time.now_ms();
        // Bandwidth accounting happens before decoding so corrupt frames
        // still count against the sender.
        self.registry
            .record_message_received(&incoming.sender, incoming.bytes.len(), now);
        self.metrics.messages_received_total.inc();

        let message = match WireMessage::decode(&incoming.bytes) {
            Ok(m) => m,
            Err(_) => {
                self.metrics.decode_failures_total.inc();
                self.bus.report(SyncError::PeerSync {
                    peer: incoming.sender.clone(),
                    kind: PeerSyncErrorKind::MessageCorrupted,
                    detail: "undecodable frame".to_string(),
                });
                self.drain_events();
                return;
            }
        };
        // Self-discovery is suppressed at the transport layer, but that is
        // not trusted here; a frame claiming to be from us is corrupt, as
        // is one whose claimed sender disagrees with the transport.
        if message.sender() == &self.local_node || message.sender() != &incoming.sender {
            self.metrics.decode_failures_total.inc();
            self.bus.report(SyncError::PeerSync {
                peer: incoming.sender.clone(),
                kind: PeerSyncErrorKind::MessageCorrupted,
                detail: "sender mismatch".to_string(),
            });
            self.drain_events();
            return;
        }

        match message {
            WireMessage::Ping(ping) => {
                let actions = self.swim.handle_ping(&ping, now, &mut self.registry);
                self.execute_swim_actions(actions).await;
            }
            WireMessage::Ack(ack) => {
                let actions =
                    self.swim
                        .handle_ack(&ack, now, &mut self.registry, &mut self.rtt);
                self.execute_swim_actions(actions).await;
            }
            WireMessage::PingReq(req) => {
                let actions = self.swim.handle_ping_req(&req, now, &mut self.registry);
                self.execute_swim_actions(actions).await;
            }
            WireMessage::DigestRequest(request) => {
                self.registry.update_anti_entropy(&request.sender, now);
                let response = self.gossip.handle_digest_request(
                    &request,
                    &self.channels,
                    self.entry_repo.as_ref(),
                );
                self.send_message(&request.sender, response).await;
            }
            WireMessage::DigestResponse(response) => {
                let (requests, errors) = self.gossip.handle_digest_response(
                    &response,
                    now,
                    &self.channels,
                    self.entry_repo.as_ref(),
                );
                for error in errors {
                    self.bus.report(error);
                }
                for request in requests {
                    self.send_message(&response.sender, request).await;
                }
            }
            WireMessage::DeltaRequest(request) => {
                match self
                    .gossip
                    .handle_delta_request(&request, &self.channels, self.entry_repo.as_ref())
                {
                    Ok(response) => self.send_message(&request.sender, response).await,
                    Err(error) => self.bus.report(error),
                }
            }
            WireMessage::DeltaResponse(response) => {
                let (merge, errors) = self.gossip.handle_delta_response(
                    response,
                    now,
                    &mut self.channels,
                    self.entry_repo.as_mut(),
                    &mut self.clock,
                );
                for error in errors {
                    self.bus.report(error);
                }
                if let Some(result) = merge {
                    self.metrics
                        .entries_merged_total
                        .inc_by(result.new_entries.len() as u64);
                }
            }
        }
        let now = self.time.now_ms();
        self.metrics
            .pending_delta_requests
            .set(self.gossip.pending_request_count(now) as i64);
        self.drain_events();
    }

    fn drain_events(&mut self) {
        let mut events = self.registry.take_events();
        for aggregate in self.channels.values_mut() {
            events.extend(aggregate.take_events());
        }
        self.publish_events(events);
        self.metrics
            .peers_reachable
            .set(self.registry.reachable_peers().len() as i64);
    }

    fn publish_events(&mut self, events: Vec<DomainEvent>) {
        for event in events {
            if let DomainEvent::BufferOverflowOccurred {
                channel,
                stream,
                author,
                dropped,
            } = &event
            {
                self.metrics.buffer_dropped_total.inc_by(*dropped as u64);
                self.bus.report(SyncError::BufferOverflow {
                    channel: channel.clone(),
                    stream: stream.clone(),
                    author: author.clone(),
                    dropped: *dropped,
                });
            }
            self.bus.publish(event);
        }
    }
}
