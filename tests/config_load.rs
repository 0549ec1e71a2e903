// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Configuration defaults, TOML parsing, and validation.

use driftsync::core::config::{ConfigError, CoordinatorConfig};
use std::fs;

#[test]
fn defaults_match_the_documented_policy() {
    let cfg = CoordinatorConfig::default();
    assert_eq!(cfg.suspicion_threshold, 5);
    assert_eq!(cfg.unreachable_threshold, 15);
    assert_eq!(cfg.unreachable_probe_interval, 5);
    assert_eq!(cfg.startup_grace_period_ms, 10_000);
    assert_eq!(cfg.congestion_threshold, 10);
    assert_eq!(cfg.indirect_probe_count, 3);
    assert_eq!(cfg.max_buffer_per_author, 100);
    assert_eq!(cfg.max_total_buffer_entries, 10_000);
    assert_eq!(cfg.pending_request_expiry_ms, 5_000);
    assert_eq!(cfg.max_payload_bytes, 32 * 1024);
    assert!(!cfg.reject_non_member_entries);
    assert!(cfg.validate().is_ok());
}

#[test]
fn partial_toml_fills_in_defaults() {
    let cfg = CoordinatorConfig::from_toml_str(
        "suspicion_threshold = 3\nstartup_grace_period_ms = 0\n",
    )
    .expect("parse");
    assert_eq!(cfg.suspicion_threshold, 3);
    assert_eq!(cfg.startup_grace_period_ms, 0);
    assert_eq!(cfg.unreachable_threshold, 15);
}

#[test]
fn inconsistent_thresholds_are_rejected() {
    let err = CoordinatorConfig::from_toml_str(
        "suspicion_threshold = 20\nunreachable_threshold = 10\n",
    )
    .expect_err("must fail");
    assert!(matches!(err, ConfigError::Invalid(_)));

    let err =
        CoordinatorConfig::from_toml_str("suspicion_threshold = 0\n").expect_err("must fail");
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let err = CoordinatorConfig::from_toml_str("suspicion_threshold = {").expect_err("must fail");
    assert!(matches!(err, ConfigError::Parse));
}

#[test]
fn config_loads_from_a_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("driftsync.toml");
    fs::write(&path, "congestion_threshold = 4\npending_request_expiry_ms = 2500\n")
        .expect("write");

    let cfg = CoordinatorConfig::load(&path).expect("load");
    assert_eq!(cfg.congestion_threshold, 4);
    assert_eq!(cfg.pending_request_expiry_ms, 2_500);

    assert!(matches!(
        CoordinatorConfig::load(dir.path().join("missing.toml")),
        Err(ConfigError::Read)
    ));
}
