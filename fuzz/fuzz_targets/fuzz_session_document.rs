#![no_main]

use libfuzzer_sys::fuzz_target;
use rta_client::{compare_multiplayer_sessions, MultiplayerSession, MultiplayerSessionReference};

fuzz_target!(|data: &[u8]| {
    let reference = MultiplayerSessionReference::new("scid", "template", "name");
    let Ok(session) = MultiplayerSession::from_response(reference, data, None, None) else {
        return;
    };

    // A document never differs from itself.
    let same = compare_multiplayer_sessions(&session, &session).ok();
    assert_eq!(same.map(|c| c.is_empty()), Some(true));
});
