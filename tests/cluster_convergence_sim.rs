// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Multi-node convergence simulations: concurrent writers must agree on a
//! single total order everywhere.

mod common;

use common::{ch, connect_all, make_node, setup_shared_stream, sim_config, st, Cluster};
use driftsync::networking::coordinator::Coordinator;
use std::time::Duration;

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

async fn assert_agreement(nodes: &[&Coordinator], expected_len: usize) {
    let mut reference = None;
    for node in nodes {
        let entries = node
            .entries(ch("ch1"), st("st1"))
            .await
            .expect("entries");
        assert_eq!(
            entries.len(),
            expected_len,
            "{} is missing entries",
            node.local_node()
        );
        match &reference {
            None => reference = Some(entries),
            Some(first) => assert_eq!(
                &entries,
                first,
                "{} disagrees on the order",
                node.local_node()
            ),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn three_concurrent_writers_agree() {
    let cluster = Cluster::new();
    let n1 = make_node(&cluster, "n1", sim_config());
    let n2 = make_node(&cluster, "n2", sim_config());
    let n3 = make_node(&cluster, "n3", sim_config());
    let nodes = [&n1, &n2, &n3];
    connect_all(&nodes).await;
    setup_shared_stream(&nodes, &ch("ch1"), &st("st1")).await;
    for node in &nodes {
        node.start().await.expect("start");
    }

    // Concurrent writes: same physical instant, disambiguated by the
    // logical counter and the author tiebreak.
    n1.append(ch("ch1"), st("st1"), vec![0x01]).await.expect("n1");
    n2.append(ch("ch1"), st("st1"), vec![0x02]).await.expect("n2");
    n3.append(ch("ch1"), st("st1"), vec![0x03]).await.expect("n3");

    settle(120).await;
    assert_agreement(&nodes, 3).await;

    for node in &nodes {
        node.dispose().await.expect("dispose");
    }
}

#[tokio::test(start_paused = true)]
async fn eight_node_fleet_converges() {
    let cluster = Cluster::new();
    let names = ["n1", "n2", "n3", "n4", "n5", "n6", "n7", "n8"];
    let owned: Vec<_> = names
        .iter()
        .map(|name| make_node(&cluster, name, sim_config()))
        .collect();
    let nodes: Vec<&Coordinator> = owned.iter().collect();
    connect_all(&nodes).await;
    setup_shared_stream(&nodes, &ch("ch1"), &st("st1")).await;
    for node in &nodes {
        node.start().await.expect("start");
    }

    for (i, node) in nodes.iter().enumerate() {
        for k in 0..5u8 {
            node.append(ch("ch1"), st("st1"), vec![i as u8, k])
                .await
                .expect("append");
        }
    }

    settle(300).await;
    assert_agreement(&nodes, 40).await;

    for node in &nodes {
        node.dispose().await.expect("dispose");
    }
}
