//! Token stream decoding must never panic.
//!
//! Walks arbitrary bytes as a method body: every item either decodes or
//! fails with a `ProtocolError`, and a decoded item always moves the
//! cursor forward.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tcg_proto::{ParameterList, PayloadReader};

fuzz_target!(|data: &[u8]| {
    let mut reader = PayloadReader::new(data);
    while !reader.is_at_end() {
        let before = reader.position();
        if reader.read_item().is_err() {
            break;
        }
        assert!(reader.position() > before, "read_item did not advance");
    }

    let mut reader = PayloadReader::new(data);
    let mut params = ParameterList::new();
    while !reader.is_at_end() {
        if reader.read_parameter(&mut params).is_err() {
            break;
        }
    }
});
