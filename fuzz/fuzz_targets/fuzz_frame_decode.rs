//! Fuzz target for the frame decoder.
//!
//! Decoding arbitrary bytes must never panic, and every message that
//! decodes must survive an encode/decode cycle unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use satellite_sync::protocol::{decode, encode};

fuzz_target!(|data: &[u8]| {
    let Ok(message) = decode(data) else { return };

    let again = decode(&encode(&message)).expect("encoded message must decode");
    assert_eq!(message, again);
});
