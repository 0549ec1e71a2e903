// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

//! Round-trip-time estimation and adaptive interval derivation.
//! This implementation is deterministic and integer-only.

#![forbid(unsafe_code)]

/// Conservative smoothed RTT before any sample exists.
pub const DEFAULT_SMOOTHED_RTT_MS: u64 = 1_000;
/// Conservative RTT variance before any sample exists.
pub const DEFAULT_RTT_VARIANCE_MS: u64 = 500;

const PING_TIMEOUT_MIN_MS: u64 = 200;
const PING_TIMEOUT_MAX_MS: u64 = 10_000;
const PROBE_INTERVAL_MIN_MS: u64 = 500;
const PROBE_INTERVAL_MAX_MS: u64 = 30_000;
const GOSSIP_INTERVAL_MIN_MS: u64 = 100;
const GOSSIP_INTERVAL_MAX_MS: u64 = 5_000;

/// RFC 6298 exponentially weighted estimate (alpha=1/8, beta=1/4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEstimate {
    /// Smoothed round-trip time in milliseconds.
    pub smoothed_rtt_ms: u64,
    /// Round-trip variance in milliseconds.
    pub rtt_variance_ms: u64,
}

impl RttEstimate {
    /// Seed from the first sample: srtt = sample, variance = sample / 2.
    pub fn from_first_sample(sample_ms: u64) -> Self {
        Self {
            smoothed_rtt_ms: sample_ms,
            rtt_variance_ms: sample_ms / 2,
        }
    }

    /// Fold in one sample. Variance updates against the previous smoothed
    /// value, then the smoothed value moves toward the sample.
    pub fn observe(&mut self, sample_ms: u64) {
        let deviation = self.smoothed_rtt_ms.abs_diff(sample_ms);
        self.rtt_variance_ms = (3 * self.rtt_variance_ms + deviation) / 4;
        self.smoothed_rtt_ms = (7 * self.smoothed_rtt_ms + sample_ms) / 8;
    }
}

/// Interval derivation from an estimate.
pub fn ping_timeout_ms(est: &RttEstimate) -> u64 {
    (est.smoothed_rtt_ms + 4 * est.rtt_variance_ms).clamp(PING_TIMEOUT_MIN_MS, PING_TIMEOUT_MAX_MS)
}

/// Probe interval: three ping timeouts, clamped.
pub fn probe_interval_ms(est: &RttEstimate) -> u64 {
    (3 * ping_timeout_ms(est)).clamp(PROBE_INTERVAL_MIN_MS, PROBE_INTERVAL_MAX_MS)
}

/// Gossip interval: two smoothed RTTs, clamped.
pub fn gossip_interval_ms(est: &RttEstimate) -> u64 {
    (2 * est.smoothed_rtt_ms).clamp(GOSSIP_INTERVAL_MIN_MS, GOSSIP_INTERVAL_MAX_MS)
}

/// Node-wide RTT tracker with conservative pre-sample defaults.
#[derive(Clone, Debug, Default)]
pub struct RttTracker {
    estimate: Option<RttEstimate>,
}

impl RttTracker {
    /// Tracker with no samples yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one sample.
    pub fn observe(&mut self, sample_ms: u64) {
        match self.estimate.as_mut() {
            Some(est) => est.observe(sample_ms),
            None => self.estimate = Some(RttEstimate::from_first_sample(sample_ms)),
        }
    }

    /// Raw estimate, if any sample arrived.
    pub fn estimate(&self) -> Option<RttEstimate> {
        self.estimate
    }

    /// Estimate in effect: measured, or the conservative defaults.
    pub fn effective(&self) -> RttEstimate {
        self.estimate.unwrap_or(RttEstimate {
            smoothed_rtt_ms: DEFAULT_SMOOTHED_RTT_MS,
            rtt_variance_ms: DEFAULT_RTT_VARIANCE_MS,
        })
    }

    /// Ping timeout, preferring a per-peer estimate when one exists.
    pub fn ping_timeout_with(&self, per_peer: Option<&RttEstimate>) -> u64 {
        ping_timeout_ms(per_peer.unwrap_or(&self.effective()))
    }

    /// Current global ping timeout.
    pub fn ping_timeout(&self) -> u64 {
        ping_timeout_ms(&self.effective())
    }

    /// Current global probe interval.
    pub fn probe_interval(&self) -> u64 {
        probe_interval_ms(&self.effective())
    }

    /// Current global gossip interval.
    pub fn gossip_interval(&self) -> u64 {
        gossip_interval_ms(&self.effective())
    }

    /// Read-only snapshot for observability.
    pub fn status(&self) -> TimingStatus {
        let est = self.effective();
        TimingStatus {
            has_samples: self.estimate.is_some(),
            smoothed_rtt_ms: est.smoothed_rtt_ms,
            rtt_variance_ms: est.rtt_variance_ms,
            ping_timeout_ms: ping_timeout_ms(&est),
            probe_interval_ms: probe_interval_ms(&est),
            gossip_interval_ms: gossip_interval_ms(&est),
        }
    }
}

/// Snapshot of the adaptive timing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingStatus {
    /// Whether any sample has been folded in.
    pub has_samples: bool,
    /// Smoothed RTT in effect.
    pub smoothed_rtt_ms: u64,
    /// Variance in effect.
    pub rtt_variance_ms: u64,
    /// Derived ping timeout.
    pub ping_timeout_ms: u64,
    /// Derived probe interval.
    pub probe_interval_ms: u64,
    /// Derived gossip interval.
    pub gossip_interval_ms: u64,
}
