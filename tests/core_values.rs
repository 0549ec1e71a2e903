// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Value objects and the hybrid logical clock.

use driftsync::core::clock::HlcClock;
use driftsync::core::types::{
    Hlc, InvalidValue, LogEntry, LogEntryId, NodeId, VersionVector, MAX_PHYSICAL_MS,
};
use std::cmp::Ordering;

fn nid(s: &str) -> NodeId {
    NodeId::new(s).expect("node id")
}

#[test]
fn identifiers_reject_empty_strings() {
    assert_eq!(NodeId::new(""), Err(InvalidValue::EmptyId));
    assert!(NodeId::new("n1").is_ok());
    assert_eq!(
        LogEntryId::new(nid("a"), 0),
        Err(InvalidValue::ZeroSequence)
    );
    assert!(LogEntryId::new(nid("a"), 1).is_ok());
}

#[test]
fn hlc_is_ordered_by_physical_then_logical() {
    let a = Hlc::new(10, 5).expect("hlc");
    let b = Hlc::new(10, 6).expect("hlc");
    let c = Hlc::new(11, 0).expect("hlc");
    assert!(a < b && b < c);
    assert_eq!(Hlc::new(MAX_PHYSICAL_MS + 1, 0), Err(InvalidValue::PhysicalOverflow));
}

#[test]
fn entry_order_breaks_hlc_ties_by_author() {
    let t = Hlc::new(10, 0).expect("hlc");
    let a = LogEntry::new(nid("a"), 1, t, vec![]).expect("entry");
    let b = LogEntry::new(nid("b"), 1, t, vec![]).expect("entry");
    assert_eq!(LogEntry::stream_cmp(&a, &b), Ordering::Less);
    assert_eq!(LogEntry::stream_cmp(&b, &a), Ordering::Greater);
}

#[test]
fn clock_now_advances_strictly() {
    let mut clock = HlcClock::new();
    let t1 = clock.now(100);
    let t2 = clock.now(100);
    let t3 = clock.now(99);
    let t4 = clock.now(200);
    assert_eq!((t1.physical_ms, t1.logical), (100, 0));
    assert_eq!((t2.physical_ms, t2.logical), (100, 1));
    assert_eq!((t3.physical_ms, t3.logical), (100, 2), "wall clock regression");
    assert_eq!((t4.physical_ms, t4.logical), (200, 0));
    assert!(t1 < t2 && t2 < t3 && t3 < t4);
}

#[test]
fn clock_receive_follows_the_hlc_rules() {
    // Remote ahead of both local state and wall clock.
    let mut clock = HlcClock::new();
    let t = clock.receive(Hlc::new(500, 3).expect("hlc"), 100);
    assert_eq!((t.physical_ms, t.logical), (500, 4));

    // Wall clock ahead of both: logical resets.
    let t = clock.receive(Hlc::new(400, 9).expect("hlc"), 600);
    assert_eq!((t.physical_ms, t.logical), (600, 0));

    // All three equal: logical is max + 1.
    let mut clock = HlcClock::from_persisted(Hlc::new(700, 2).expect("hlc"));
    let t = clock.receive(Hlc::new(700, 5).expect("hlc"), 700);
    assert_eq!((t.physical_ms, t.logical), (700, 6));

    // Local ahead of remote and wall clock.
    let mut clock = HlcClock::from_persisted(Hlc::new(800, 2).expect("hlc"));
    let t = clock.receive(Hlc::new(300, 9).expect("hlc"), 100);
    assert_eq!((t.physical_ms, t.logical), (800, 3));
}

#[test]
fn clock_never_regresses_across_restart() {
    let mut clock = HlcClock::new();
    clock.now(5_000);
    let persisted = clock.current();

    let mut restarted = HlcClock::from_persisted(persisted);
    let t = restarted.now(1_000);
    assert!(t > persisted, "restart with a slow wall clock must not regress");
}

#[test]
fn version_vector_basics() {
    let mut vv = VersionVector::new();
    assert_eq!(vv.get(&nid("a")), 0);
    assert_eq!(vv.increment(&nid("a")), 1);
    assert_eq!(vv.increment(&nid("a")), 2);
    vv.set(nid("b"), 5);
    vv.set(nid("b"), 3);
    assert_eq!(vv.get(&nid("b")), 5, "set keeps the maximum");
    assert_eq!(vv.len(), 2);
}

#[test]
fn version_vector_merge_diff_dominates() {
    let a: VersionVector = [(nid("a"), 3u64), (nid("b"), 1u64)].into_iter().collect();
    let b: VersionVector = [(nid("b"), 4u64), (nid("c"), 2u64)].into_iter().collect();

    let mut merged = a.clone();
    merged.merge(&b);
    assert_eq!(merged.get(&nid("a")), 3);
    assert_eq!(merged.get(&nid("b")), 4);
    assert_eq!(merged.get(&nid("c")), 2);
    assert!(merged.dominates(&a) && merged.dominates(&b));
    assert!(!a.dominates(&b) && !b.dominates(&a));

    let diff = a.diff(&b);
    assert_eq!(diff, vec![(nid("b"), 4), (nid("c"), 2)]);
    assert!(merged.diff(&merged).is_empty());

    // Absent keys read as zero on both sides of domination.
    let empty = VersionVector::new();
    assert!(a.dominates(&empty));
    assert!(!empty.dominates(&a));
    assert!(empty.dominates(&empty));
}
