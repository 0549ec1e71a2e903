// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Channel aggregate: merge partitioning, out-of-order buffering, caps,
//! membership rules, and state materialization.

use driftsync::core::channel::{BufferLimits, ChannelAggregate, ChannelError, RetentionPolicy};
use driftsync::core::events::DomainEvent;
use driftsync::core::repository::{EntryRepository, InMemoryEntryStore};
use driftsync::core::types::{ChannelId, Hlc, LogEntry, NodeId, StreamId};

fn nid(s: &str) -> NodeId {
    NodeId::new(s).expect("node id")
}
fn cid(s: &str) -> ChannelId {
    ChannelId::new(s).expect("channel id")
}
fn sid(s: &str) -> StreamId {
    StreamId::new(s).expect("stream id")
}

fn entry(author: &str, sequence: u64, physical_ms: u64) -> LogEntry {
    LogEntry::new(
        nid(author),
        sequence,
        Hlc::new(physical_ms, 0).expect("hlc"),
        vec![sequence as u8],
    )
    .expect("entry")
}

fn fixture() -> (ChannelAggregate, InMemoryEntryStore) {
    let mut agg = ChannelAggregate::new(cid("ch1"), nid("local"), BufferLimits::default());
    agg.create_stream(sid("st1"), RetentionPolicy::KeepAll);
    agg.take_events();
    (agg, InMemoryEntryStore::new())
}

#[test]
fn merge_partitions_ready_duplicate_rejected_and_buffered() {
    let (mut agg, mut repo) = fixture();

    let result = agg
        .merge_entries(
            &sid("st1"),
            vec![entry("r", 1, 10), entry("r", 2, 20)],
            &mut repo,
        )
        .expect("merge");
    assert_eq!(result.new_entries.len(), 2);
    assert_eq!(result.new_version.get(&nid("r")), 2);

    // Same batch again: pure duplicates, no state change.
    let result = agg
        .merge_entries(
            &sid("st1"),
            vec![entry("r", 1, 10), entry("r", 2, 20)],
            &mut repo,
        )
        .expect("merge");
    assert_eq!(result.new_entries.len(), 0);
    assert_eq!(result.duplicates, 2);
    assert_eq!(repo.entry_count(&cid("ch1"), &sid("st1")), 2);

    // A gap parks the entry; filling the gap releases it.
    let result = agg
        .merge_entries(&sid("st1"), vec![entry("r", 4, 40)], &mut repo)
        .expect("merge");
    assert_eq!(result.out_of_order, 1);
    assert_eq!(result.new_entries.len(), 0);
    assert_eq!(agg.buffered_entry_count(), 1);

    let result = agg
        .merge_entries(&sid("st1"), vec![entry("r", 3, 30)], &mut repo)
        .expect("merge");
    assert_eq!(
        result.new_entries.len(),
        2,
        "gap fill must release the buffered successor"
    );
    assert_eq!(result.new_version.get(&nid("r")), 4);
    assert_eq!(agg.buffered_entry_count(), 0);
}

#[test]
fn merge_emits_entries_merged_only_for_new_deliveries() {
    let (mut agg, mut repo) = fixture();

    agg.merge_entries(&sid("st1"), vec![entry("r", 1, 10)], &mut repo)
        .expect("merge");
    let events = agg.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, DomainEvent::EntriesMerged { new_entries, .. } if new_entries.len() == 1)));

    agg.merge_entries(&sid("st1"), vec![entry("r", 1, 10)], &mut repo)
        .expect("merge");
    let events = agg.take_events();
    assert!(
        events.is_empty(),
        "duplicate-only merges are silent: {events:?}"
    );
}

#[test]
fn per_author_buffer_cap_drops_oldest_and_reports() {
    let limits = BufferLimits {
        per_author: 3,
        total: 100,
    };
    let mut agg = ChannelAggregate::new(cid("ch1"), nid("local"), limits);
    agg.create_stream(sid("st1"), RetentionPolicy::KeepAll);
    agg.take_events();
    let mut repo = InMemoryEntryStore::new();

    // All out of order (sequence 1 is missing); the fourth overflows.
    let batch = vec![
        entry("r", 2, 20),
        entry("r", 3, 30),
        entry("r", 4, 40),
        entry("r", 5, 50),
    ];
    let result = agg.merge_entries(&sid("st1"), batch, &mut repo).expect("merge");
    assert_eq!(result.out_of_order, 4);
    assert_eq!(result.dropped, 1);
    assert_eq!(agg.buffered_entry_count(), 3);
    let events = agg.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        DomainEvent::BufferOverflowOccurred { dropped: 1, .. }
    )));

    // The oldest buffered entry (sequence 2) was the one dropped: filling
    // the gap only releases 3..=5.
    let result = agg
        .merge_entries(&sid("st1"), vec![entry("r", 1, 10)], &mut repo)
        .expect("merge");
    assert_eq!(result.new_entries.len(), 1);
    assert_eq!(result.new_version.get(&nid("r")), 1);
}

#[test]
fn version_vector_tracks_latest_sequence_per_author() {
    let (mut agg, mut repo) = fixture();
    agg.merge_entries(
        &sid("st1"),
        vec![entry("a", 1, 10), entry("b", 1, 11), entry("b", 2, 12)],
        &mut repo,
    )
    .expect("merge");
    let vv = repo.version_vector(&cid("ch1"), &sid("st1"));
    assert_eq!(vv.get(&nid("a")), repo.latest_sequence(&cid("ch1"), &sid("st1"), &nid("a")));
    assert_eq!(vv.get(&nid("b")), repo.latest_sequence(&cid("ch1"), &sid("st1"), &nid("b")));
    assert_eq!(vv.get(&nid("b")), 2);
}

#[test]
fn entries_are_listed_in_timestamp_author_order() {
    let (mut agg, mut repo) = fixture();
    agg.merge_entries(
        &sid("st1"),
        vec![
            entry("b", 1, 100),
            entry("a", 1, 100),
            entry("a", 2, 50),
        ],
        &mut repo,
    )
    .expect("merge");
    let all = repo.get_all(&cid("ch1"), &sid("st1"));
    let seqs: Vec<(u64, String)> = all
        .iter()
        .map(|e| (e.timestamp.physical_ms, e.author.to_string()))
        .collect();
    assert_eq!(
        seqs,
        vec![
            (50, "a".to_string()),
            (100, "a".to_string()),
            (100, "b".to_string())
        ]
    );
}

#[test]
fn local_append_assigns_contiguous_sequences() {
    let (mut agg, mut repo) = fixture();
    let e1 = agg
        .append_entry(&sid("st1"), vec![1], Hlc::new(10, 0).expect("hlc"), &mut repo)
        .expect("append");
    let e2 = agg
        .append_entry(&sid("st1"), vec![2], Hlc::new(11, 0).expect("hlc"), &mut repo)
        .expect("append");
    assert_eq!((e1.sequence, e2.sequence), (1, 2));
    let events = agg.take_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, DomainEvent::EntryAppended { .. }))
            .count(),
        2
    );
}

#[test]
fn append_to_unknown_stream_fails() {
    let (mut agg, mut repo) = fixture();
    let err = agg
        .append_entry(&sid("nope"), vec![1], Hlc::new(10, 0).expect("hlc"), &mut repo)
        .expect_err("must fail");
    assert!(matches!(err, ChannelError::StreamNotFound));
}

#[test]
fn membership_rules() {
    let (mut agg, _repo) = fixture();
    assert!(agg.is_member(&nid("local")));
    assert!(agg.add_member(nid("m1")));
    assert!(!agg.add_member(nid("m1")));
    assert!(agg.remove_member(&nid("m1")).expect("remove"));
    assert!(!agg.remove_member(&nid("m1")).expect("remove absent"));
    assert!(matches!(
        agg.remove_member(&nid("local")),
        Err(ChannelError::RemoveLocalNode)
    ));
    assert!(!agg.create_stream(sid("st1"), RetentionPolicy::KeepAll));
}

#[test]
fn non_member_entries_rejected_under_host_policy() {
    let (mut agg, mut repo) = fixture();
    agg.set_membership_enforcement(true);
    agg.add_member(nid("m"));
    agg.take_events();

    let result = agg
        .merge_entries(
            &sid("st1"),
            vec![entry("m", 1, 10), entry("x", 1, 20), entry("x", 2, 30)],
            &mut repo,
        )
        .expect("merge");
    assert_eq!(result.new_entries.len(), 1);
    assert_eq!(result.rejected, 2);
    assert_eq!(repo.latest_sequence(&cid("ch1"), &sid("st1"), &nid("x")), 0);

    // One report per rejected author, not per entry.
    let events = agg.take_events();
    let rejections: Vec<&DomainEvent> = events
        .iter()
        .filter(|e| matches!(e, DomainEvent::NonMemberEntriesRejected { .. }))
        .collect();
    assert_eq!(rejections.len(), 1);
    assert!(matches!(
        rejections[0],
        DomainEvent::NonMemberEntriesRejected { author, .. } if author == &nid("x")
    ));

    // With the policy off (the default), the same author is admitted.
    let (mut open, mut repo2) = fixture();
    let result = open
        .merge_entries(&sid("st1"), vec![entry("x", 1, 20)], &mut repo2)
        .expect("merge");
    assert_eq!(result.new_entries.len(), 1);
    assert!(!open
        .take_events()
        .iter()
        .any(|e| matches!(e, DomainEvent::NonMemberEntriesRejected { .. })));
}

#[test]
fn materializer_folds_in_stream_order() {
    let (mut agg, mut repo) = fixture();
    agg.register_materializer(
        sid("st1"),
        Vec::new,
        |mut acc: Vec<u8>, entry: &LogEntry| {
            acc.extend_from_slice(&entry.payload);
            acc
        },
    );
    agg.merge_entries(
        &sid("st1"),
        vec![entry("b", 1, 100), entry("a", 1, 50)],
        &mut repo,
    )
    .expect("merge");

    let state: Vec<u8> = agg.get_state(&sid("st1"), &repo).expect("state");
    assert_eq!(state, vec![1, 1]);

    // Order is by timestamp, so "a" (t=50) folds before "b" (t=100).
    let ordered: Vec<u8> = agg.get_state(&sid("st1"), &repo).expect("state");
    assert_eq!(ordered.len(), 2);

    assert!(matches!(
        agg.get_state::<Vec<u8>>(&sid("none"), &repo),
        Err(ChannelError::StreamNotFound)
    ));
}

#[test]
#[should_panic(expected = "materializer state type mismatch")]
fn materializer_type_mismatch_is_a_programming_error() {
    let (mut agg, repo) = fixture();
    agg.register_materializer(sid("st1"), || 0u64, |acc: u64, _e: &LogEntry| acc + 1);
    let _: String = agg.get_state(&sid("st1"), &repo).expect("state");
}
