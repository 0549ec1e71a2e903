// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Failure-detector state machine: late acks, escalation, refutation, and
//! the indirect probe path. The detector is synchronous, so these tests
//! drive it with explicit clocks.

use driftsync::core::config::CoordinatorConfig;
use driftsync::core::events::PeerStatus;
use driftsync::core::types::NodeId;
use driftsync::networking::peer_registry::PeerRegistry;
use driftsync::networking::rtt::RttTracker;
use driftsync::networking::swim::{FailureDetector, SwimAction};
use driftsync::networking::wire::{Ack, Ping, PingReq, WireMessage};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn nid(s: &str) -> NodeId {
    NodeId::new(s).expect("node id")
}

fn cfg() -> CoordinatorConfig {
    CoordinatorConfig {
        startup_grace_period_ms: 0,
        ..CoordinatorConfig::default()
    }
}

fn sent_ping(actions: &[SwimAction]) -> Option<(NodeId, Ping)> {
    actions.iter().find_map(|a| match a {
        SwimAction::Send {
            to,
            message: WireMessage::Ping(p),
        } => Some((to.clone(), p.clone())),
        _ => None,
    })
}

fn sent_ping_reqs(actions: &[SwimAction]) -> Vec<(NodeId, PingReq)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SwimAction::Send {
                to,
                message: WireMessage::PingReq(r),
            } => Some((to.clone(), r.clone())),
            _ => None,
        })
        .collect()
}

fn sent_acks(actions: &[SwimAction]) -> Vec<(NodeId, Ack)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SwimAction::Send {
                to,
                message: WireMessage::Ack(k),
            } => Some((to.clone(), k.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn late_ack_counts_as_success_in_two_device_case() {
    let n1 = nid("n1");
    let n2 = nid("n2");
    let mut registry = PeerRegistry::new(n1.clone(), 0);
    registry.add_peer(n2.clone(), 0).expect("add");
    let mut detector = FailureDetector::new(n1, &cfg());
    let mut rtt = RttTracker::new();
    let mut rng = StdRng::seed_from_u64(7);

    let actions = detector.start_probe_round(0, &mut registry, &rtt, &mut rng);
    let (to, ping) = sent_ping(&actions).expect("direct ping");
    assert_eq!(to, n2);
    // No samples yet: ping timeout is srtt + 4*var = 3000 ms.
    assert!(actions.iter().any(|a| matches!(
        a,
        SwimAction::ScheduleDirectTimeout { after_ms: 3000, .. }
    )));
    assert!(actions.iter().any(|a| matches!(
        a,
        SwimAction::ScheduleRoundEnd { after_ms: 6000, .. }
    )));

    // Direct timeout fires with the ack still in flight. There is no third
    // device, so no indirect probes go out.
    let timeout_actions = detector.handle_direct_timeout(ping.sequence, &registry, &mut rng);
    assert!(sent_ping_reqs(&timeout_actions).is_empty());

    // The ack lands ~175 ms after the direct timeout, inside the grace
    // window.
    let ack = Ack {
        sender: n2.clone(),
        sequence: ping.sequence,
        incarnation: 0,
    };
    detector.handle_ack(&ack, 3175, &mut registry, &mut rtt);

    detector.handle_round_end(ping.sequence, &mut registry);
    let peer = registry.get(&n2).expect("peer");
    assert_eq!(peer.status, PeerStatus::Reachable);
    assert_eq!(peer.failed_probe_count, 0);
    assert_eq!(detector.pending_probe_count(), 0);
    assert!(rtt.estimate().is_some(), "late ack still feeds the tracker");
}

#[test]
fn unanswered_probes_escalate_to_suspected_then_unreachable() {
    let n1 = nid("n1");
    let n2 = nid("n2");
    let mut registry = PeerRegistry::new(n1.clone(), 0);
    registry.add_peer(n2.clone(), 0).expect("add");
    let mut detector = FailureDetector::new(n1, &cfg());
    let rtt = RttTracker::new();
    let mut rng = StdRng::seed_from_u64(3);

    let mut failures = 0u32;
    let mut now = 0u64;
    while failures < 15 {
        let actions = detector.start_probe_round(now, &mut registry, &rtt, &mut rng);
        now += 10_000;
        let Some((_, ping)) = sent_ping(&actions) else {
            // Unreachable peers are only probed every few rounds.
            assert_eq!(
                registry.get(&n2).expect("peer").status,
                PeerStatus::Unreachable
            );
            continue;
        };
        detector.handle_round_end(ping.sequence, &mut registry);
        failures = registry.get(&n2).expect("peer").failed_probe_count;

        let status = registry.get(&n2).expect("peer").status;
        if failures < 5 {
            assert_eq!(status, PeerStatus::Reachable);
        } else if failures < 15 {
            assert_eq!(status, PeerStatus::Suspected);
        } else {
            assert_eq!(status, PeerStatus::Unreachable);
        }
    }
}

#[test]
fn suspect_probe_triggers_incarnation_refutation() {
    let n1 = nid("n1");
    let n2 = nid("n2");
    let mut reg1 = PeerRegistry::new(n1.clone(), 0);
    reg1.add_peer(n2.clone(), 0).expect("add");
    reg1.update_status(&n2, PeerStatus::Suspected);
    let mut det1 = FailureDetector::new(n1.clone(), &cfg());

    let mut reg2 = PeerRegistry::new(n2.clone(), 0);
    reg2.add_peer(n1.clone(), 0).expect("add");
    let mut det2 = FailureDetector::new(n2.clone(), &cfg());

    let mut rtt1 = RttTracker::new();
    let mut rng = StdRng::seed_from_u64(11);

    // n1 probes the peer it suspects; the ping carries the suspicion.
    let actions = det1.start_probe_round(0, &mut reg1, &rtt1, &mut rng);
    let (_, ping) = sent_ping(&actions).expect("ping");
    assert!(ping.suspect);

    // n2 refutes by bumping its incarnation and acking with it.
    let reply = det2.handle_ping(&ping, 10, &mut reg2);
    let acks = sent_acks(&reply);
    assert_eq!(acks.len(), 1);
    let (_, ack) = &acks[0];
    assert_eq!(ack.incarnation, 1);
    assert_eq!(reg2.local_incarnation(), 1);

    // One exchange is enough: n1 adopts and marks n2 reachable.
    det1.handle_ack(ack, 20, &mut reg1, &mut rtt1);
    let peer = reg1.get(&n2).expect("peer");
    assert_eq!(peer.status, PeerStatus::Reachable);
    assert_eq!(peer.incarnation, 1);
    assert_eq!(peer.failed_probe_count, 0);
}

#[test]
fn indirect_probe_relays_ack_to_origin() {
    let n1 = nid("n1");
    let mut reg1 = PeerRegistry::new(n1.clone(), 0);
    reg1.add_peer(nid("n2"), 0).expect("add");
    reg1.add_peer(nid("n3"), 0).expect("add");
    let mut det1 = FailureDetector::new(n1.clone(), &cfg());
    let mut rtt = RttTracker::new();
    let mut rng = StdRng::seed_from_u64(5);

    let actions = det1.start_probe_round(0, &mut reg1, &rtt, &mut rng);
    let (target, ping) = sent_ping(&actions).expect("direct ping");
    let intermediary = if target == nid("n2") { nid("n3") } else { nid("n2") };

    // Direct timeout fans out to the one available intermediary.
    let timeout_actions = det1.handle_direct_timeout(ping.sequence, &reg1, &mut rng);
    let reqs = sent_ping_reqs(&timeout_actions);
    assert_eq!(reqs.len(), 1);
    let (req_to, req) = &reqs[0];
    assert_eq!(req_to, &intermediary);
    assert_eq!(req.target, target);
    assert_eq!(req.sequence, ping.sequence);

    // The intermediary pings the target on n1's behalf...
    let mut reg_mid = PeerRegistry::new(intermediary.clone(), 0);
    reg_mid.add_peer(n1.clone(), 0).expect("add");
    reg_mid.add_peer(target.clone(), 0).expect("add");
    let mut det_mid = FailureDetector::new(intermediary.clone(), &cfg());
    let relay_actions = det_mid.handle_ping_req(req, 100, &mut reg_mid);
    let (relay_to, relay_ping) = sent_ping(&relay_actions).expect("relay ping");
    assert_eq!(relay_to, target);
    assert!(!relay_ping.suspect);

    // ...and forwards the target's ack back under the origin sequence.
    let mut rtt_mid = RttTracker::new();
    let target_ack = Ack {
        sender: target.clone(),
        sequence: relay_ping.sequence,
        incarnation: 0,
    };
    let forwarded = det_mid.handle_ack(&target_ack, 150, &mut reg_mid, &mut rtt_mid);
    let acks = sent_acks(&forwarded);
    assert_eq!(acks.len(), 1);
    let (fwd_to, fwd_ack) = &acks[0];
    assert_eq!(fwd_to, &n1);
    assert_eq!(fwd_ack.sequence, ping.sequence);

    // The origin treats the forwarded ack as probe success for the target.
    det1.handle_ack(fwd_ack, 200, &mut reg1, &mut rtt);
    det1.handle_round_end(ping.sequence, &mut reg1);
    assert_eq!(
        reg1.get(&target).expect("peer").failed_probe_count,
        0,
        "indirect ack must clear the probe"
    );
}

#[test]
fn startup_grace_period_skips_probing() {
    let n1 = nid("n1");
    let n2 = nid("n2");
    let mut registry = PeerRegistry::new(n1.clone(), 0);
    registry.add_peer(n2, 5_000).expect("add");
    let mut detector = FailureDetector::new(n1, &CoordinatorConfig::default());
    let rtt = RttTracker::new();
    let mut rng = StdRng::seed_from_u64(1);

    // 5 s after the peer was added: still inside the 10 s grace window.
    let actions = detector.start_probe_round(10_000, &mut registry, &rtt, &mut rng);
    assert!(actions.is_empty());

    // Past the window the peer is probed normally.
    let actions = detector.start_probe_round(16_000, &mut registry, &rtt, &mut rng);
    assert!(sent_ping(&actions).is_some());
}
