// Copyright (c) 2026 Driftsync
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use driftsync::core::config::CoordinatorConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Best-effort: ensure config parsing does not panic on hostile input.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = CoordinatorConfig::from_toml_str(s);
    }
});
