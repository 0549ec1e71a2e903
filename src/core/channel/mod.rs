// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Channel aggregate, merge semantics, and retention.

pub mod aggregate;
pub mod retention;

pub use aggregate::{
    BoxedState, BufferLimits, ChannelAggregate, ChannelDelta, ChannelDigest, ChannelError,
    MergeResult, StreamDigest,
};
pub use retention::{CompactionResult, RetentionPolicy};
