#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for RTA frames.
//!
//! Fixtures mirror frames observed from the real-time activity service.

use rta_client::error_codes::{self, SubscriptionError};
use rta_client::protocol::{opcode, ClientFrame, FrameError, ServerFrame};
use serde_json::{json, Value};

// ════════════════════════════════════════════════════════════════════
// Client frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn subscribe_uri_is_escaped_as_a_json_string() {
    let frame = ClientFrame::Subscribe {
        seq: 3,
        resource_uri: r#"https://userstats.xboxlive.com/users/xuid(1)/scids/a/stats/"Q""#.into(),
    };
    let text = frame.to_json().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value[0], json!(opcode::SUBSCRIBE));
    assert_eq!(
        value[2],
        json!(r#"https://userstats.xboxlive.com/users/xuid(1)/scids/a/stats/"Q""#)
    );
    assert_eq!(ClientFrame::parse(&text).unwrap(), frame);
}

#[test]
fn client_parse_rejects_server_only_opcodes() {
    assert!(matches!(
        ClientFrame::parse("[3,1,{}]").unwrap_err(),
        FrameError::UnknownOpcode(3)
    ));
    assert!(matches!(
        ClientFrame::parse(r#"[1,"x","uri"]"#).unwrap_err(),
        FrameError::Malformed { opcode: 1, index: 1 }
    ));
}

// ════════════════════════════════════════════════════════════════════
// Server frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn statistic_subscribe_ack_fixture() {
    let text = r#"[1,1,0,42,{"name":"Stat","type":"Integer","value":"31"}]"#;
    match ServerFrame::parse(text).unwrap() {
        ServerFrame::SubscribeAck {
            seq,
            status,
            subscription_id,
            payload,
        } => {
            assert_eq!(seq, 1);
            assert_eq!(status, error_codes::STATUS_SUCCESS);
            assert_eq!(subscription_id, Some(42));
            assert_eq!(payload["value"], json!("31"));
        }
        other => panic!("expected SubscribeAck, got {other:?}"),
    }
}

#[test]
fn connection_id_ack_fixture() {
    let text = r#"[1,2,0,7,{"ConnectionId":"4424f6d9-5c5e-4fd5-a2ae-b9b1e0d8f1e3"}]"#;
    let ServerFrame::SubscribeAck { payload, .. } = ServerFrame::parse(text).unwrap() else {
        panic!("expected SubscribeAck");
    };
    assert_eq!(
        payload["ConnectionId"],
        json!("4424f6d9-5c5e-4fd5-a2ae-b9b1e0d8f1e3")
    );
}

#[test]
fn shoulder_tap_event_fixture() {
    let text = r#"[3,7,{"shoulderTaps":[{"resource":"scid~lobby~s1","changeNumber":12,"branch":"b1"}]}]"#;
    assert_eq!(
        ServerFrame::parse(text).unwrap(),
        ServerFrame::Event {
            subscription_id: 7,
            payload: json!({"shoulderTaps": [
                {"resource": "scid~lobby~s1", "changeNumber": 12, "branch": "b1"}
            ]}),
        }
    );
}

#[test]
fn unsubscribe_ack_fixture() {
    assert_eq!(
        ServerFrame::parse("[2,5,0]").unwrap(),
        ServerFrame::UnsubscribeAck { seq: 5, status: 0 }
    );
    assert!(matches!(
        ServerFrame::parse("[2,5]").unwrap_err(),
        FrameError::Malformed { opcode: 2, index: 2 }
    ));
}

#[test]
fn frames_tolerate_whitespace() {
    assert_eq!(
        ServerFrame::parse(" [ 3 , 1 , \"x\" ] ").unwrap(),
        ServerFrame::Event {
            subscription_id: 1,
            payload: json!("x"),
        }
    );
}

#[test]
fn encoded_server_frames_parse_back() {
    let frames = [
        ServerFrame::SubscribeAck {
            seq: 4,
            status: 2,
            subscription_id: None,
            payload: Value::Null,
        },
        ServerFrame::UnsubscribeAck { seq: 9, status: 0 },
        ServerFrame::Event {
            subscription_id: u64::from(u32::MAX) + 5,
            payload: json!([1, 2, 3]),
        },
        ServerFrame::Resync,
    ];
    for frame in frames {
        assert_eq!(ServerFrame::parse(&frame.to_json()).unwrap(), frame);
    }
}

// ════════════════════════════════════════════════════════════════════
// Status codes
// ════════════════════════════════════════════════════════════════════

#[test]
fn status_classification() {
    assert_eq!(SubscriptionError::from_status(0), None);
    assert_eq!(
        SubscriptionError::from_status(1),
        Some(SubscriptionError::TooManySubscriptions)
    );
    assert_eq!(
        SubscriptionError::from_status(2),
        Some(SubscriptionError::AccessDenied)
    );
    assert_eq!(
        SubscriptionError::from_status(500),
        Some(SubscriptionError::Generic(500))
    );
    assert_eq!(SubscriptionError::Generic(500).status_code(), 500);
}

#[test]
fn only_throttling_and_unavailability_are_transient() {
    assert!(error_codes::is_transient(error_codes::STATUS_THROTTLED));
    assert!(error_codes::is_transient(
        error_codes::STATUS_SERVICE_UNAVAILABLE
    ));
    assert!(!error_codes::is_transient(1));
    assert!(!error_codes::is_transient(2));
    assert!(!error_codes::is_transient(0));
}

#[test]
fn error_descriptions_are_not_empty() {
    for error in [
        SubscriptionError::TooManySubscriptions,
        SubscriptionError::AccessDenied,
        SubscriptionError::Generic(9),
    ] {
        assert!(!error.description().is_empty());
        assert!(!error.to_string().is_empty());
    }
}
