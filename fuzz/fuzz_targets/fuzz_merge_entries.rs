// Copyright (c) 2026 Driftsync
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use arbitrary::Arbitrary;
use driftsync::core::channel::{BufferLimits, ChannelAggregate, RetentionPolicy};
use driftsync::core::repository::{EntryRepository, InMemoryEntryStore};
use driftsync::core::types::{ChannelId, Hlc, LogEntry, NodeId, StreamId, MAX_PHYSICAL_MS};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct RawEntry {
    author: u8,
    sequence: u64,
    physical_ms: u64,
    logical: u16,
    payload: Vec<u8>,
}

fuzz_target!(|batches: Vec<Vec<RawEntry>>| {
    let channel = ChannelId::new("ch").expect("channel id");
    let stream = StreamId::new("st").expect("stream id");
    let mut agg = ChannelAggregate::new(
        channel.clone(),
        NodeId::new("local").expect("node id"),
        BufferLimits {
            per_author: 8,
            total: 64,
        },
    );
    agg.create_stream(stream.clone(), RetentionPolicy::KeepAll);
    let mut repo = InMemoryEntryStore::new();

    for batch in batches {
        let entries: Vec<LogEntry> = batch
            .into_iter()
            .filter_map(|raw| {
                let author = NodeId::new(format!("n{}", raw.author % 4)).ok()?;
                let hlc = Hlc::new(raw.physical_ms % (MAX_PHYSICAL_MS + 1), raw.logical).ok()?;
                LogEntry::new(author, raw.sequence.max(1) % 1_000 + 1, hlc, raw.payload).ok()
            })
            .collect();
        let before: Vec<u64> = (0..4)
            .map(|i| {
                let author = NodeId::new(format!("n{i}")).expect("node id");
                repo.latest_sequence(&channel, &stream, &author)
            })
            .collect();
        agg.merge_entries(&stream, entries, &mut repo)
            .expect("merge never fails on the in-memory store");
        // Delivery bookkeeping is monotone no matter the input.
        for (i, prev) in before.iter().enumerate() {
            let author = NodeId::new(format!("n{i}")).expect("node id");
            assert!(repo.latest_sequence(&channel, &stream, &author) >= *prev);
        }
    }
});
