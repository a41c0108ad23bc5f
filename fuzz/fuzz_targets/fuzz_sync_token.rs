//! Fuzz target for sync token decoding.
//!
//! Client tokens are opaque strings handed back verbatim, so decoding must
//! reject garbage without panicking and re-encode accepted tokens stably.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_sync_token -- -max_total_time=600

#![no_main]

use galsync_core::SyncToken;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(token) = SyncToken::decode(raw) else {
        return;
    };

    let encoded = token.encode();
    let reparsed = SyncToken::decode(&encoded).unwrap();
    assert_eq!(reparsed.encode(), encoded);

    // Merging with itself changes nothing
    assert_eq!(token.merge(&token), token);

    let _ = token.do_mailbox_sync();
});
