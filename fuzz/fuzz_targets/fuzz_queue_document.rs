//! Fuzz target for persisted queue document decoding.
//!
//! Whatever is found in a storage slot, `decode_queue` returns an error or
//! the well-formed records, never a panic. Anything it returns must encode
//! again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tq_queue::{decode_queue, encode_queue};

fuzz_target!(|data: &str| {
    if let Ok(decoded) = decode_queue(data) {
        let _ = encode_queue(&decoded.events, 0);
    }
});
