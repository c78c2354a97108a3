//! Fuzz target for token decoding and verification.
//!
//! Session keys arrive in the phase-2 query string before anything about the
//! peer is known.

#![no_main]

use duplex_core::{IdentityClaims, Secret, SessionClaims, token};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let secret = Secret::from("fuzz");
        let _ = token::decode::<SessionClaims>(input);
        let _ = token::verify::<SessionClaims>(input, &secret);
        let _ = token::verify::<IdentityClaims>(input, &secret);
        let _ = token::tokens_match(input, "a.b.c");
    }
});
