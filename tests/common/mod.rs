// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]
#![allow(dead_code)]

//! Shared test fixture: an in-memory transport hub with partition control,
//! plus helpers that assemble a coordinator on virtual (paused) tokio time.

use async_trait::async_trait;
use driftsync::core::config::CoordinatorConfig;
use driftsync::core::channel::RetentionPolicy;
use driftsync::core::ports::{
    IncomingMessage, MessagePort, PortError, Priority, TimePort, TokioTimePort,
};
use driftsync::core::repository::{InMemoryChannelStore, InMemoryEntryStore};
use driftsync::core::types::{ChannelId, NodeId, StreamId};
use driftsync::monitoring::Metrics;
use driftsync::networking::coordinator::{Coordinator, CoordinatorPorts};
use futures::stream::BoxStream;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Frame limit the hub enforces, mirroring the recommended transport cap.
pub const TRANSPORT_LIMIT_BYTES: usize = 32 * 1024;

#[derive(Default)]
struct HubInner {
    subscribers: HashMap<NodeId, Vec<mpsc::UnboundedSender<IncomingMessage>>>,
    blocked: HashSet<(NodeId, NodeId)>,
}

/// In-memory transport connecting every node port it hands out.
#[derive(Clone)]
pub struct TestHub {
    inner: Arc<Mutex<HubInner>>,
    time: Arc<TokioTimePort>,
}

impl TestHub {
    pub fn new(time: Arc<TokioTimePort>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            time,
        }
    }

    pub fn port(&self, node: &NodeId) -> HubPort {
        HubPort {
            inner: Arc::clone(&self.inner),
            time: Arc::clone(&self.time),
            node: node.clone(),
        }
    }

    /// Block traffic in both directions between `a` and `b`.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.blocked.insert((a.clone(), b.clone()));
        inner.blocked.insert((b.clone(), a.clone()));
    }

    /// Restore traffic between `a` and `b`.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.blocked.remove(&(a.clone(), b.clone()));
        inner.blocked.remove(&(b.clone(), a.clone()));
    }
}

/// One node's view of the hub.
pub struct HubPort {
    inner: Arc<Mutex<HubInner>>,
    time: Arc<TokioTimePort>,
    node: NodeId,
}

#[async_trait]
impl MessagePort for HubPort {
    async fn send(
        &self,
        to: &NodeId,
        bytes: Vec<u8>,
        _priority: Priority,
    ) -> Result<(), PortError> {
        if bytes.len() > TRANSPORT_LIMIT_BYTES {
            return Err(PortError::TooLarge);
        }
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().expect("hub lock");
        if inner.blocked.contains(&(self.node.clone(), to.clone())) {
            return Err(PortError::Send("partitioned".to_string()));
        }
        let Some(subs) = inner.subscribers.get_mut(to) else {
            return Err(PortError::Send("unknown destination".to_string()));
        };
        subs.retain(|tx| {
            tx.send(IncomingMessage {
                sender: self.node.clone(),
                bytes: bytes.clone(),
                received_at_ms: now,
            })
            .is_ok()
        });
        Ok(())
    }

    fn incoming(&self) -> BoxStream<'static, IncomingMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("hub lock")
            .subscribers
            .entry(self.node.clone())
            .or_default()
            .push(tx);
        Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    fn pending_send_count(&self, _peer: &NodeId) -> usize {
        0
    }

    fn total_pending_send_count(&self) -> usize {
        0
    }
}

/// Shared fixtures for one simulated fleet.
pub struct Cluster {
    pub time: Arc<TokioTimePort>,
    pub hub: TestHub,
}

impl Cluster {
    pub fn new() -> Self {
        let time = Arc::new(TokioTimePort::with_epoch_ms(1_700_000_000_000));
        let hub = TestHub::new(Arc::clone(&time));
        Self { time, hub }
    }
}

fn name_seed(name: &str) -> u64 {
    name.bytes().fold(0x9e37_79b9u64, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(u64::from(b))
    })
}

/// Policy knobs suited to virtual-time simulations.
pub fn sim_config() -> CoordinatorConfig {
    CoordinatorConfig {
        startup_grace_period_ms: 0,
        ..CoordinatorConfig::default()
    }
}

/// Assemble a coordinator wired to the cluster hub.
pub fn make_node(cluster: &Cluster, name: &str, config: CoordinatorConfig) -> Coordinator {
    let id = NodeId::new(name).expect("node id");
    let ports = CoordinatorPorts {
        transport: Arc::new(cluster.hub.port(&id)),
        time: Arc::clone(&cluster.time) as Arc<dyn TimePort>,
        entry_repository: Box::new(InMemoryEntryStore::new()),
        channel_repository: Box::new(InMemoryChannelStore::new()),
        peer_repository: None,
        state_store: None,
        rng: Box::new(StdRng::seed_from_u64(name_seed(name))),
    };
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    Coordinator::create(id, config, ports, metrics).expect("coordinator create")
}

/// Make every node aware of every other node.
pub async fn connect_all(nodes: &[&Coordinator]) {
    for a in nodes {
        for b in nodes {
            if a.local_node() != b.local_node() {
                a.add_peer(b.local_node().clone()).await.expect("add peer");
            }
        }
    }
}

/// Create the same channel and stream on every node.
pub async fn setup_shared_stream(nodes: &[&Coordinator], channel: &ChannelId, stream: &StreamId) {
    for node in nodes {
        node.create_channel(channel.clone()).await.expect("channel");
        node.create_stream(channel.clone(), stream.clone(), RetentionPolicy::KeepAll)
            .await
            .expect("stream");
    }
}

pub fn ch(name: &str) -> ChannelId {
    ChannelId::new(name).expect("channel id")
}

pub fn st(name: &str) -> StreamId {
    StreamId::new(name).expect("stream id")
}
