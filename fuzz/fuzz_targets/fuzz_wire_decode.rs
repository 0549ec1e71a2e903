// Copyright (c) 2026 Driftsync
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use driftsync::networking::wire::WireMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the decoder; anything that decodes
    // must survive a re-encode round trip.
    if let Ok(message) = WireMessage::decode(data) {
        let bytes = message.encode().expect("decoded message re-encodes");
        let again = WireMessage::decode(&bytes).expect("re-encoded message decodes");
        assert_eq!(again, message);
    }
});
