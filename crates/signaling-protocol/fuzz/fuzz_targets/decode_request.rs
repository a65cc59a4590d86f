#![no_main]

use libfuzzer_sys::fuzz_target;
use signaling_protocol::codec::{decode_request, DEFAULT_MAX_FRAME_SIZE};

fuzz_target!(|data: &[u8]| {
    // Signaling frames arrive as WebSocket text, so only UTF-8 input is reachable
    if let Ok(text) = std::str::from_utf8(data) {
        // Must never panic; any request with a readable id must keep it
        if let Err(e) = decode_request(text, DEFAULT_MAX_FRAME_SIZE) {
            let _ = e.request_id();
        }
    }
});
