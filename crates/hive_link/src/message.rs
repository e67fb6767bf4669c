//! Wire vocabulary: payload encoding and steady-state frame classification.
//!
//! Payloads are JSON values. Besides application messages (any value), the
//! protocol reserves:
//!
//! - the heartbeat sentinel string,
//! - `["REQUEST", fingerprint, operation, payload]`,
//! - `["RESPONSE", fingerprint, result]` and
//!   `["RESPONSE", fingerprint, null, error]` for a failed handler.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::NetworkError;

/// Sentinel sent during key exchange when a side opts out of encryption.
pub const NOT_ENCRYPTION: &str = "NOT_ENCRYPTION";

/// Positive handshake acknowledgement.
pub const ACK_YES: &str = "YES";

/// Heartbeat payload. Never delivered to the application.
pub const HEARTBEAT: &str = "__HEARTBEAT__";

pub const REQUEST_TAG: &str = "REQUEST";
pub const RESPONSE_TAG: &str = "RESPONSE";

/// Serialize a value for the wire.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, NetworkError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a value received from the wire.
pub fn decode_value(bytes: &[u8]) -> Result<Value, NetworkError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// An application message received from a named session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Name of the session the message arrived on.
    pub from: String,
    pub payload: Value,
}

/// A classified steady-state frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat,
    Request {
        fingerprint: String,
        operation: String,
        payload: Value,
    },
    Response {
        fingerprint: String,
        result: Result<Value, String>,
    },
    Message(Value),
}

impl Inbound {
    /// Classify a decoded frame. Anything that is not exactly a heartbeat
    /// or a well-formed tagged RPC array is an application message.
    pub fn classify(value: Value) -> Self {
        if value.as_str() == Some(HEARTBEAT) {
            return Self::Heartbeat;
        }

        let Some(items) = value.as_array() else {
            return Self::Message(value);
        };

        match (items.first().and_then(Value::as_str), items.len()) {
            (Some(REQUEST_TAG), 4) => match (items[1].as_str(), items[2].as_str()) {
                (Some(fp), Some(op)) => Self::Request {
                    fingerprint: fp.to_string(),
                    operation: op.to_string(),
                    payload: items[3].clone(),
                },
                _ => Self::Message(value),
            },
            (Some(RESPONSE_TAG), 3) => match items[1].as_str() {
                Some(fp) => Self::Response {
                    fingerprint: fp.to_string(),
                    result: Ok(items[2].clone()),
                },
                None => Self::Message(value),
            },
            (Some(RESPONSE_TAG), 4) => match (items[1].as_str(), items[3].as_str()) {
                (Some(fp), Some(err)) if items[2].is_null() => Self::Response {
                    fingerprint: fp.to_string(),
                    result: Err(err.to_string()),
                },
                _ => Self::Message(value),
            },
            _ => Self::Message(value),
        }
    }
}

/// The heartbeat frame value.
pub fn heartbeat() -> Value {
    Value::String(HEARTBEAT.to_string())
}

/// Build an RPC request frame value.
pub fn request(fingerprint: &str, operation: &str, payload: Value) -> Value {
    json!([REQUEST_TAG, fingerprint, operation, payload])
}

/// Build an RPC response frame value.
pub fn response(fingerprint: &str, result: Result<Value, String>) -> Value {
    match result {
        Ok(value) => json!([RESPONSE_TAG, fingerprint, value]),
        Err(message) => json!([RESPONSE_TAG, fingerprint, Value::Null, message]),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_classified() {
        assert_eq!(Inbound::classify(heartbeat()), Inbound::Heartbeat);
    }

    #[test]
    fn test_request_classified() {
        let frame = request("fp-1", "sum", json!([1, 2]));
        assert_eq!(
            Inbound::classify(frame),
            Inbound::Request {
                fingerprint: "fp-1".to_string(),
                operation: "sum".to_string(),
                payload: json!([1, 2]),
            }
        );
    }

    #[test]
    fn test_response_and_error_response_classified() {
        assert_eq!(
            Inbound::classify(response("fp-2", Ok(json!(3)))),
            Inbound::Response {
                fingerprint: "fp-2".to_string(),
                result: Ok(json!(3)),
            }
        );
        assert_eq!(
            Inbound::classify(response("fp-3", Err("boom".to_string()))),
            Inbound::Response {
                fingerprint: "fp-3".to_string(),
                result: Err("boom".to_string()),
            }
        );
    }

    #[test]
    fn test_lookalikes_are_plain_messages() {
        let cases = vec![
            json!("HEARTBEAT"),
            json!(["REQUEST", "fp"]),
            json!(["REQUEST", 7, "op", null]),
            json!(["RESPONSE"]),
            json!(["RESPONSE", "fp", 1, 2, 3]),
            json!({"tag": "REQUEST"}),
            json!(42),
            json!(null),
        ];
        for case in cases {
            assert_eq!(Inbound::classify(case.clone()), Inbound::Message(case));
        }
    }

    #[test]
    fn test_value_encoding_nested() {
        let value = json!(["tuple", ["nested", 1, 2.5], {"k": "v"}, null, true]);
        let bytes = encode_value(&value).unwrap();
        assert_eq!(decode_value(&bytes).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_value(b"\xff\x00"),
            Err(NetworkError::Serialization(_))
        ));
    }
}
