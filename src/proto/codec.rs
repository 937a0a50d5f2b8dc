// src/proto/codec.rs

//! Frame encoding and decoding.
//!
//! A frame is the JSON text of one message followed by the separator byte.
//! The connection read loop accumulates bytes up to each separator and hands
//! the cut here; partial trailing bytes stay buffered in the reader until
//! more data arrives.

use super::{FRAME_SEPARATOR, Message};
use crate::error::{Error, Result};

/// Encode one message, including the trailing separator.
pub fn encode_frame(message: &Message) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(&message.to_value())
        .expect("message serialization is infallible");
    bytes.push(FRAME_SEPARATOR);
    bytes
}

/// Decode the bytes of one frame. Accepts input with or without the
/// trailing separator byte.
pub fn decode_frame(bytes: &[u8]) -> Result<Message> {
    let body = match bytes.split_last() {
        Some((&last, rest)) if last == FRAME_SEPARATOR => rest,
        _ => bytes,
    };
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::Protocol(format!("malformed JSON frame: {e}")))?;
    Message::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Request, Response};
    use serde_json::json;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Request(Request {
                no: 42,
                request_type: "poll".to_string(),
                data: Some(json!({ "targets": ["low", "high"] })),
                password: Some("secret".to_string()),
            }),
            Message::Response(Response::ok(42, json!("ok"))),
            Message::Response(Response::error(0, "invalid password")),
            Message::Ping,
            Message::Pong,
        ]
    }

    #[test]
    fn test_round_trip_all_kinds() {
        for message in sample_messages() {
            let frame = encode_frame(&message);
            assert_eq!(*frame.last().unwrap(), FRAME_SEPARATOR);
            let decoded = decode_frame(&frame).unwrap();
            assert_eq!(decoded, message, "frame must survive a round trip");
        }
    }

    #[test]
    fn test_decode_without_separator() {
        let mut frame = encode_frame(&Message::Ping);
        frame.pop();
        assert_eq!(decode_frame(&frame).unwrap(), Message::Ping);
    }

    #[test]
    fn test_stream_split_on_separator() {
        // Two frames and a partial third, the way the read loop sees them.
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(&Message::Ping));
        stream.extend_from_slice(&encode_frame(&Message::Pong));
        stream.extend_from_slice(b"[2");

        let mut frames: Vec<&[u8]> = stream.split(|&b| b == FRAME_SEPARATOR).collect();
        let trailing = frames.pop().unwrap();
        assert_eq!(trailing, b"[2", "partial frame must wait for more bytes");
        assert_eq!(decode_frame(frames[0]).unwrap(), Message::Ping);
        assert_eq!(decode_frame(frames[1]).unwrap(), Message::Pong);
    }

    #[test]
    fn test_malformed_json_is_a_protocol_error() {
        let err = decode_frame(b"{nope\x04").unwrap_err();
        assert!(err.to_string().contains("malformed JSON frame"));
    }
}
