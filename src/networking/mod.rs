#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: protocol engines, wire codec, peer registry, coordinator.

pub mod coordinator;
pub mod gossip;
pub mod peer_registry;
pub mod rtt;
pub mod swim;
pub mod wire;
