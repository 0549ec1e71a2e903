// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Algebraic laws of version-vector merge.

use driftsync::core::types::{NodeId, VersionVector};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn arb_version_vector() -> impl Strategy<Value = VersionVector> {
    prop::collection::btree_map("[a-d]", 0u64..50, 0..4).prop_map(|m: BTreeMap<String, u64>| {
        m.into_iter()
            .map(|(k, v)| (NodeId::new(k).expect("node id"), v))
            .collect()
    })
}

fn merged(a: &VersionVector, b: &VersionVector) -> VersionVector {
    let mut out = a.clone();
    out.merge(b);
    out
}

proptest! {
    #[test]
    fn prop_merge_commutative(a in arb_version_vector(), b in arb_version_vector()) {
        prop_assert_eq!(merged(&a, &b), merged(&b, &a));
    }

    #[test]
    fn prop_merge_associative(
        a in arb_version_vector(),
        b in arb_version_vector(),
        c in arb_version_vector(),
    ) {
        prop_assert_eq!(merged(&merged(&a, &b), &c), merged(&a, &merged(&b, &c)));
    }

    #[test]
    fn prop_merge_idempotent(a in arb_version_vector()) {
        prop_assert_eq!(merged(&a, &a), a);
    }

    #[test]
    fn prop_merge_is_pairwise_max_and_dominates(
        a in arb_version_vector(),
        b in arb_version_vector(),
    ) {
        let m = merged(&a, &b);
        for (author, seq) in m.iter() {
            prop_assert_eq!(seq, a.get(author).max(b.get(author)));
        }
        prop_assert!(m.dominates(&a));
        prop_assert!(m.dominates(&b));
    }

    #[test]
    fn prop_diff_lists_strictly_higher_entries(
        a in arb_version_vector(),
        b in arb_version_vector(),
    ) {
        for (author, seq) in a.diff(&b) {
            prop_assert!(seq > a.get(&author));
            prop_assert_eq!(seq, b.get(&author));
        }
        // Domination means nothing is missing.
        if a.dominates(&b) {
            prop_assert!(a.diff(&b).is_empty());
        }
    }
}
