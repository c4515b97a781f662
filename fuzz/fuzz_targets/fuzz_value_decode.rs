#![no_main]

//! Fuzz target for the bounded msgpack decoder.
//!
//! # Goal
//! Verify that arbitrary frame bodies do not cause:
//! - Panics or unbounded allocation in the decoder
//! - Values that violate the configured depth/length caps

use libfuzzer_sys::fuzz_target;
use wardgate::wire::{DecodeLimits, Decoder};

fuzz_target!(|data: &[u8]| {
    let mut decoder = Decoder::new(data, DecodeLimits::default());
    while !decoder.is_empty() {
        if decoder.read_value().is_err() {
            break;
        }
    }
});
