//! Fuzz target for phase-1 message parsing.
//!
//! Frames, request envelopes and replies arrive from unauthenticated peers;
//! parsing them must never panic.

#![no_main]

use duplex_handshake::{Frame, Reply, RequestEnvelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = Frame::decode(input);
        let _: Result<RequestEnvelope, _> = serde_json::from_str(input);
    }

    let _: Result<Reply, _> = serde_json::from_slice(data);
});
