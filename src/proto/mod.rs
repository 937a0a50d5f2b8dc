// src/proto/mod.rs

//! Wire message model.
//!
//! Every message is a JSON array `[type, payload?]` where `type` is one of
//! `{0: request, 1: response, 2: ping, 3: pong}`. Requests and responses
//! carry an object payload correlated by a per-connection sequence number
//! `no`; ping and pong carry nothing.

pub mod codec;

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Byte appended after every encoded message (ASCII EOT).
pub const FRAME_SEPARATOR: u8 = 0x04;

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_PING: u64 = 2;
const TYPE_PONG: u64 = 3;

/// Sequence numbers wrap below this bound.
const SEQUENCE_WRAP: u32 = 999_999;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Ping,
    Pong,
}

/// Payload of a request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub no: u32,

    #[serde(rename = "type")]
    pub request_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Payload of a response frame. At most one of `data` and `error` is
/// meaningful; both absent is a valid bodiless acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub no: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(no: u32, data: Value) -> Self {
        Self { no, data: Some(data), error: None }
    }

    pub fn error(no: u32, error: impl Into<String>) -> Self {
        Self { no, data: None, error: Some(error.into()) }
    }

    /// Fold the `error` field into a `Result`, keeping `data` on success.
    pub fn into_result(self) -> Result<Option<Value>> {
        match self.error {
            Some(e) => Err(Error::Validation(e)),
            None => Ok(self.data),
        }
    }
}

impl Message {
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(request) => json!([TYPE_REQUEST, request]),
            Message::Response(response) => json!([TYPE_RESPONSE, response]),
            Message::Ping => json!([TYPE_PING]),
            Message::Pong => json!([TYPE_PONG]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(items) = value else {
            return Err(Error::Protocol("message must be a JSON array".to_string()));
        };
        let discriminant = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Protocol("message type must be an integer".to_string()))?;
        let payload = items.get(1).cloned();

        match discriminant {
            TYPE_REQUEST => {
                let payload = payload
                    .ok_or_else(|| Error::Protocol("request without payload".to_string()))?;
                let request: Request = serde_json::from_value(payload)
                    .map_err(|e| Error::Protocol(format!("invalid request payload: {e}")))?;
                Ok(Message::Request(request))
            }
            TYPE_RESPONSE => {
                let payload = payload
                    .ok_or_else(|| Error::Protocol("response without payload".to_string()))?;
                let response: Response = serde_json::from_value(payload)
                    .map_err(|e| Error::Protocol(format!("invalid response payload: {e}")))?;
                Ok(Message::Response(response))
            }
            TYPE_PING => Ok(Message::Ping),
            TYPE_PONG => Ok(Message::Pong),
            other => Err(Error::Protocol(format!("unknown message type {other}"))),
        }
    }
}

/// Per-connection request counter.
///
/// Starts at a random value in `[1, 999999)` and wraps back to 1; zero is
/// never issued, which keeps it available as the "sender unknown" marker on
/// error responses to unparseable frames.
#[derive(Debug)]
pub struct SequenceNo(u32);

impl SequenceNo {
    pub fn new() -> Self {
        let start = rand::thread_rng().gen_range(0..SEQUENCE_WRAP);
        Self(start.max(1))
    }

    pub fn next(&mut self) -> u32 {
        let no = self.0;
        self.0 += 1;
        if self.0 >= SEQUENCE_WRAP {
            self.0 = 1;
        }
        no
    }
}

impl Default for SequenceNo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let message = Message::Request(Request {
            no: 17,
            request_type: "poll".to_string(),
            data: Some(json!({ "targets": ["low"] })),
            password: None,
        });
        let decoded = Message::from_value(message.to_value()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let message = Message::Request(Request {
            no: 1,
            request_type: "status".to_string(),
            data: None,
            password: None,
        });
        let encoded = serde_json::to_string(&message.to_value()).unwrap();
        assert!(!encoded.contains("data"), "absent data must not serialize");
        assert!(!encoded.contains("password"));
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(Message::from_value(json!([2])).unwrap(), Message::Ping);
        assert_eq!(Message::from_value(json!([3])).unwrap(), Message::Pong);
    }

    #[test]
    fn test_bad_shapes_rejected() {
        assert!(Message::from_value(json!({"no": 1})).is_err());
        assert!(Message::from_value(json!(["request"])).is_err());
        assert!(Message::from_value(json!([9])).is_err());
        assert!(Message::from_value(json!([0])).is_err(), "request needs a payload");
        assert!(Message::from_value(json!([0, {"type": "poll"}])).is_err(), "request needs a no");
    }

    #[test]
    fn test_bodiless_response_allowed() {
        let decoded = Message::from_value(json!([1, {"no": 5}])).unwrap();
        assert_eq!(decoded, Message::Response(Response { no: 5, data: None, error: None }));
    }

    #[test]
    fn test_sequence_skips_zero_and_wraps() {
        let mut seq = SequenceNo(SEQUENCE_WRAP - 1);
        assert_eq!(seq.next(), SEQUENCE_WRAP - 1);
        assert_eq!(seq.next(), 1, "wrap must skip zero");

        for _ in 0..1000 {
            let mut seq = SequenceNo::new();
            assert_ne!(seq.next(), 0);
        }
    }

    #[test]
    fn test_response_into_result() {
        assert!(Response::error(1, "boom").into_result().is_err());
        assert_eq!(Response::ok(1, json!("ok")).into_result().unwrap(), Some(json!("ok")));
        let bodiless = Response { no: 1, data: None, error: None };
        assert_eq!(bodiless.into_result().unwrap(), None);
    }
}
