//! Fuzz target for network message decoding.
//!
//! This target tests that arbitrary bytes cannot crash the message decoder.
//! It ensures that malformed or malicious datagrams are handled gracefully
//! without panicking or causing undefined behavior.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary input
//! - No unbounded memory allocation
//! - A successfully decoded message survives a re-encode
//! - Header peeking agrees with the full decode

#![no_main]

use libfuzzer_sys::fuzz_target;

use arena_sync::network::codec::{decode_message, encode_message, peek_header};

fuzz_target!(|data: &[u8]| {
    // Malformed data must return Err, not panic
    let Ok(msg) = decode_message(data) else {
        return;
    };

    if let Ok((kind, index)) = peek_header(data) {
        assert_eq!(kind, msg.kind());
        assert_eq!(index, msg.index);
    }

    let bytes = encode_message(&msg).expect("decoded message must re-encode");
    assert_eq!(decode_message(&bytes).ok(), Some(msg));
});
