#![no_main]

use libfuzzer_sys::fuzz_target;
use rta_client::protocol::{ClientFrame, ServerFrame};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Anything that parses must encode back to a frame that parses.
    if let Ok(frame) = ServerFrame::parse(text) {
        assert!(ServerFrame::parse(&frame.to_json()).is_ok());
    }

    if let Ok(frame) = ClientFrame::parse(text) {
        if let Ok(encoded) = frame.to_json() {
            assert!(ClientFrame::parse(&encoded).is_ok());
        }
    }
});
