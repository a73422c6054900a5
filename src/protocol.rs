//! Wire codec for the real-time activity protocol.
//!
//! Every frame is a JSON array whose first element is an opcode:
//!
//! | Direction | Opcode | Shape                                       |
//! |-----------|--------|---------------------------------------------|
//! | → server  | 1      | `[1, seq, resourceUri]`                     |
//! | ← server  | 1      | `[1, seq, statusCode, subId, initPayload]`  |
//! | → server  | 2      | `[2, seq, subId]`                           |
//! | ← server  | 2      | `[2, seq, statusCode]`                      |
//! | ← server  | 3      | `[3, subId, payload]`                       |
//! | ← server  | 4      | `[4]`                                       |
//!
//! Sequence numbers are assigned by the client and correlate a request with
//! its acknowledgement. Subscription ids are assigned by the service and are
//! only stable for the lifetime of one socket.

use serde::ser::{SerializeTuple, Serializer};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ── Type aliases ────────────────────────────────────────────────────

/// Client-assigned request sequence number.
pub type SequenceNumber = u32;

/// Service-assigned subscription id.
pub type SubscriptionId = u64;

/// Frame opcodes.
pub mod opcode {
    /// Subscribe request / acknowledgement.
    pub const SUBSCRIBE: u64 = 1;
    /// Unsubscribe request / acknowledgement.
    pub const UNSUBSCRIBE: u64 = 2;
    /// Event for a live subscription.
    pub const EVENT: u64 = 3;
    /// Resync-required signal.
    pub const RESYNC: u64 = 4;
}

// ── Errors ──────────────────────────────────────────────────────────

/// Reasons an incoming frame could not be decoded.
///
/// Malformed frames are logged and dropped by the connection; they never
/// tear the connection down.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text was not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON value was not a non-empty array with a numeric opcode.
    #[error("frame is not an opcode-tagged array")]
    NotAnArray,
    /// A required element was missing or had the wrong type.
    #[error("opcode {opcode}: element {index} missing or malformed")]
    Malformed {
        /// Opcode of the frame.
        opcode: u64,
        /// Index of the offending element.
        index: usize,
    },
    /// The opcode is not part of the protocol.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u64),
}

// ── Client frames ───────────────────────────────────────────────────

/// Frames sent from the client to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// `[1, seq, resourceUri]`
    Subscribe {
        seq: SequenceNumber,
        resource_uri: String,
    },
    /// `[2, seq, subId]`
    Unsubscribe {
        seq: SequenceNumber,
        subscription_id: SubscriptionId,
    },
}

impl ClientFrame {
    /// Sequence number carried by this frame.
    pub fn seq(&self) -> SequenceNumber {
        match self {
            Self::Subscribe { seq, .. } | Self::Unsubscribe { seq, .. } => *seq,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a client frame. Used by test servers and loopback transports.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let items = value.as_array().ok_or(FrameError::NotAnArray)?;
        let op = items.first().and_then(Value::as_u64).ok_or(FrameError::NotAnArray)?;
        match op {
            opcode::SUBSCRIBE => Ok(Self::Subscribe {
                seq: seq_at(items, op, 1)?,
                resource_uri: items
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or(FrameError::Malformed { opcode: op, index: 2 })?
                    .to_owned(),
            }),
            opcode::UNSUBSCRIBE => Ok(Self::Unsubscribe {
                seq: seq_at(items, op, 1)?,
                subscription_id: u64_at(items, op, 2)?,
            }),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

impl Serialize for ClientFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        match self {
            Self::Subscribe { seq, resource_uri } => {
                tuple.serialize_element(&opcode::SUBSCRIBE)?;
                tuple.serialize_element(seq)?;
                tuple.serialize_element(resource_uri)?;
            }
            Self::Unsubscribe {
                seq,
                subscription_id,
            } => {
                tuple.serialize_element(&opcode::UNSUBSCRIBE)?;
                tuple.serialize_element(seq)?;
                tuple.serialize_element(subscription_id)?;
            }
        }
        tuple.end()
    }
}

// ── Server frames ───────────────────────────────────────────────────

/// Frames received from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// `[1, seq, statusCode, subId, initPayload]`
    ///
    /// Rejected acks may carry an error string or nothing in place of
    /// `subscription_id`. A success ack without one is kept as-is; the
    /// connection treats it as a failed subscribe.
    SubscribeAck {
        seq: SequenceNumber,
        status: u32,
        subscription_id: Option<SubscriptionId>,
        payload: Value,
    },
    /// `[2, seq, statusCode]`
    UnsubscribeAck { seq: SequenceNumber, status: u32 },
    /// `[3, subId, payload]`
    Event {
        subscription_id: SubscriptionId,
        payload: Value,
    },
    /// `[4]`
    Resync,
}

impl ServerFrame {
    /// Decode a frame received from the socket.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode a frame from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut items) = value else {
            return Err(FrameError::NotAnArray);
        };
        let op = items.first().and_then(Value::as_u64).ok_or(FrameError::NotAnArray)?;
        match op {
            opcode::SUBSCRIBE => {
                let seq = seq_at(&items, op, 1)?;
                let status = status_at(&items, op, 2)?;
                let subscription_id = items.get(3).and_then(Value::as_u64);
                let payload = take_or_null(&mut items, 4);
                Ok(Self::SubscribeAck {
                    seq,
                    status,
                    subscription_id,
                    payload,
                })
            }
            opcode::UNSUBSCRIBE => Ok(Self::UnsubscribeAck {
                seq: seq_at(&items, op, 1)?,
                status: status_at(&items, op, 2)?,
            }),
            opcode::EVENT => {
                let subscription_id = u64_at(&items, op, 1)?;
                let payload = take_or_null(&mut items, 2);
                Ok(Self::Event {
                    subscription_id,
                    payload,
                })
            }
            opcode::RESYNC => Ok(Self::Resync),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    /// Encode as JSON text. Used by test servers and loopback transports.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::SubscribeAck {
                seq,
                status,
                subscription_id,
                payload,
            } => match subscription_id {
                Some(id) => serde_json::json!([opcode::SUBSCRIBE, seq, status, id, payload]),
                None => serde_json::json!([opcode::SUBSCRIBE, seq, status]),
            },
            Self::UnsubscribeAck { seq, status } => {
                serde_json::json!([opcode::UNSUBSCRIBE, seq, status])
            }
            Self::Event {
                subscription_id,
                payload,
            } => serde_json::json!([opcode::EVENT, subscription_id, payload]),
            Self::Resync => serde_json::json!([opcode::RESYNC]),
        };
        value.to_string()
    }
}

// ── Element helpers ─────────────────────────────────────────────────

fn u64_at(items: &[Value], opcode: u64, index: usize) -> Result<u64, FrameError> {
    items
        .get(index)
        .and_then(Value::as_u64)
        .ok_or(FrameError::Malformed { opcode, index })
}

fn seq_at(items: &[Value], opcode: u64, index: usize) -> Result<SequenceNumber, FrameError> {
    u64_at(items, opcode, index)?
        .try_into()
        .map_err(|_| FrameError::Malformed { opcode, index })
}

fn status_at(items: &[Value], opcode: u64, index: usize) -> Result<u32, FrameError> {
    u64_at(items, opcode, index)?
        .try_into()
        .map_err(|_| FrameError::Malformed { opcode, index })
}

fn take_or_null(items: &mut [Value], index: usize) -> Value {
    items.get_mut(index).map(Value::take).unwrap_or(Value::Null)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_frame_is_a_three_element_array() {
        let frame = ClientFrame::Subscribe {
            seq: 7,
            resource_uri: "stats/Stat".into(),
        };
        assert_eq!(frame.to_json().unwrap(), r#"[1,7,"stats/Stat"]"#);
    }

    #[test]
    fn unsubscribe_frame_carries_subscription_id() {
        let frame = ClientFrame::Unsubscribe {
            seq: 9,
            subscription_id: 42,
        };
        assert_eq!(frame.to_json().unwrap(), "[2,9,42]");
    }

    #[test]
    fn rejected_ack_without_subscription_id_parses() {
        let frame = ServerFrame::parse(r#"[1,1,1,"error"]"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::SubscribeAck {
                seq: 1,
                status: 1,
                subscription_id: None,
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn successful_ack_without_subscription_id_still_parses() {
        let frame = ServerFrame::parse("[1,1,0]").unwrap();
        assert_eq!(
            frame,
            ServerFrame::SubscribeAck {
                seq: 1,
                status: 0,
                subscription_id: None,
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn event_without_payload_yields_null() {
        let frame = ServerFrame::parse("[3,42]").unwrap();
        assert_eq!(
            frame,
            ServerFrame::Event {
                subscription_id: 42,
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn resync_ignores_trailing_elements() {
        assert_eq!(ServerFrame::parse("[4]").unwrap(), ServerFrame::Resync);
        assert_eq!(ServerFrame::parse("[4, 1]").unwrap(), ServerFrame::Resync);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(
            ServerFrame::parse("[9, 1]").unwrap_err(),
            FrameError::UnknownOpcode(9)
        ));
    }

    #[test]
    fn non_array_is_rejected() {
        assert!(matches!(
            ServerFrame::parse(r#"{"op":1}"#).unwrap_err(),
            FrameError::NotAnArray
        ));
        assert!(matches!(
            ServerFrame::parse("[]").unwrap_err(),
            FrameError::NotAnArray
        ));
        assert!(matches!(
            ServerFrame::parse("not json").unwrap_err(),
            FrameError::Json(_)
        ));
    }

    #[test]
    fn oversized_sequence_number_is_malformed() {
        let text = json!([2, u64::from(u32::MAX) + 1, 0]).to_string();
        assert!(matches!(
            ServerFrame::parse(&text).unwrap_err(),
            FrameError::Malformed { opcode: 2, index: 1 }
        ));
    }

    #[test]
    fn server_frame_encoding_matches_wire_shape() {
        let ack = ServerFrame::SubscribeAck {
            seq: 1,
            status: 0,
            subscription_id: Some(42),
            payload: json!({"value": "31"}),
        };
        let reparsed: Value = serde_json::from_str(&ack.to_json()).unwrap();
        assert_eq!(reparsed, json!([1, 1, 0, 42, {"value": "31"}]));
    }
}
