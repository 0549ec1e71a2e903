// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Observability: prometheus metrics container.

pub mod metrics;

pub use metrics::{Metrics, MetricsError};
