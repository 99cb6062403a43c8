//! Frame Codec
//!
//! Converts between wire [`Frame`]s and message types.
//!
//! Outbound messages are always sent as JSON text frames. Inbound frames are
//! decoded leniently: a text or binary frame holding a JSON object becomes
//! [`Inbound::Parsed`]; anything else (invalid JSON, a JSON array or scalar,
//! non-UTF-8 bytes) is handed on untouched as [`Inbound::Raw`].
//!
//! An object never falls back to raw because one of its known fields has an
//! unexpected type. Such a field is kept in `extra` and the message still
//! routes by its `type`.
//!
//! # Security
//!
//! - Maximum outbound frame size is enforced before transmission
//! - Oversized inbound frames are not parsed

use serde_json::{Map, Value};

use crate::messages::{Inbound, InboundMessage, OutboundMessage, RawPayload};

use super::traits::{Frame, TransportError};

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Encode an outbound message as a JSON text frame
///
/// # Errors
///
/// Returns `TransportError::SerializationError` if the encoded frame exceeds
/// [`MAX_FRAME_SIZE`].
pub fn encode(message: &OutboundMessage) -> Result<Frame, TransportError> {
    let json = message.to_json().to_string();

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame too large: {} bytes (max: {})",
            json.len(),
            MAX_FRAME_SIZE
        )));
    }

    Ok(Frame::Text(json))
}

/// Decode an inbound frame, falling back to the raw payload
#[must_use]
pub fn decode(frame: Frame) -> Inbound {
    if frame.len() > MAX_FRAME_SIZE {
        tracing::warn!(size = frame.len(), "Inbound frame exceeds size limit, not parsing");
        return Inbound::Raw(raw(frame));
    }

    let parsed = match &frame {
        Frame::Text(text) => parse_object(text.as_bytes()),
        Frame::Binary(bytes) => parse_object(bytes),
    };

    match parsed {
        Some(message) => Inbound::Parsed(message),
        None => {
            tracing::debug!(size = frame.len(), "Inbound frame is not a JSON object, passing raw");
            Inbound::Raw(raw(frame))
        }
    }
}

fn parse_object(bytes: &[u8]) -> Option<InboundMessage> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Some(from_object(map)),
        _ => None,
    }
}

/// Build a message from a JSON object without rejecting it
///
/// A known field holding an unexpected type is left in `extra` under its
/// wire name. Numeric ids are accepted as their decimal string.
fn from_object(mut map: Map<String, Value>) -> InboundMessage {
    let id = take_id(&mut map, "id");
    let frontend_generated_id = take_id(&mut map, "frontendGeneratedId");
    let backend_id = take_id(&mut map, "backendId");
    let kind = take_string(&mut map, "type");
    let text = take_string(&mut map, "text");
    let state = take_string(&mut map, "state");
    let done = match map.remove("done") {
        Some(Value::Bool(done)) => Some(done),
        Some(Value::Null) | None => None,
        Some(other) => {
            tracing::debug!(value = %other, "Ignoring non-boolean done field");
            map.insert("done".to_string(), other);
            None
        }
    };

    InboundMessage {
        id,
        frontend_generated_id,
        backend_id,
        kind,
        text,
        done,
        state,
        extra: map,
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(value) => Some(value),
        Value::Null => None,
        other => {
            map.insert(key.to_string(), other);
            None
        }
    }
}

fn take_id(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(value) => Some(value),
        Value::Number(number) => Some(number.to_string()),
        Value::Null => None,
        other => {
            map.insert(key.to_string(), other);
            None
        }
    }
}

fn raw(frame: Frame) -> RawPayload {
    match frame {
        Frame::Text(text) => RawPayload::Text(text),
        Frame::Binary(bytes) => RawPayload::Binary(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RequestId;
    use serde_json::json;

    #[test]
    fn test_encode_stop() {
        let frame = encode(&OutboundMessage::Stop {
            id: RequestId::new("r1"),
        })
        .unwrap();

        let Frame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "stop", "id": "r1"}));
    }

    #[test]
    fn test_encode_too_large() {
        let big = "x".repeat(MAX_FRAME_SIZE + 1);
        let result = encode(&OutboundMessage::Custom(json!({ "blob": big })));
        assert!(matches!(result, Err(TransportError::SerializationError(_))));
    }

    #[test]
    fn test_decode_text_object() {
        let inbound = decode(Frame::Text(r#"{"type":"chunk","id":"r1","text":"hi"}"#.into()));
        let message = inbound.as_parsed().unwrap();
        assert_eq!(message.kind(), Some("chunk"));
        assert_eq!(message.text.as_deref(), Some("hi"));
    }

    #[test]
    fn test_decode_binary_json() {
        let inbound = decode(Frame::Binary(br#"{"type":"status","state":"thinking"}"#.to_vec()));
        assert_eq!(inbound.kind(), Some("status"));
    }

    #[test]
    fn test_decode_invalid_json_is_raw() {
        let inbound = decode(Frame::Text("hello there".into()));
        assert_eq!(inbound, Inbound::Raw(RawPayload::Text("hello there".into())));
    }

    #[test]
    fn test_decode_non_object_is_raw() {
        let inbound = decode(Frame::Text("[1,2,3]".into()));
        assert!(matches!(inbound, Inbound::Raw(RawPayload::Text(_))));

        let inbound = decode(Frame::Binary(vec![0xff, 0x00, 0x10]));
        assert_eq!(inbound, Inbound::Raw(RawPayload::Binary(vec![0xff, 0x00, 0x10])));
    }

    #[test]
    fn test_decode_wrong_field_type_keeps_routing() {
        let inbound = decode(Frame::Text(r#"{"type":"chunk","id":"r1","done":"yes"}"#.into()));
        let message = inbound.as_parsed().unwrap();
        assert_eq!(message.kind(), Some("chunk"));
        assert_eq!(message.done, None);
        assert_eq!(message.extra.get("done"), Some(&json!("yes")));
    }

    #[test]
    fn test_decode_numeric_id() {
        let inbound = decode(Frame::Text(r#"{"type":"chunk","id":42,"text":7}"#.into()));
        let message = inbound.as_parsed().unwrap();
        assert_eq!(message.id.as_deref(), Some("42"));
        assert_eq!(message.text, None);
        assert_eq!(message.extra.get("text"), Some(&json!(7)));
    }

    #[test]
    fn test_decode_keeps_unknown_fields() {
        let inbound = decode(Frame::Text(
            r#"{"type":"chunk","id":"r1","frontendGeneratedId":"local_1","seq":3,"meta":{"a":1}}"#.into(),
        ));
        let message = inbound.as_parsed().unwrap();
        assert_eq!(message.frontend_generated_id.as_deref(), Some("local_1"));
        assert_eq!(message.sequence(), Some(3));
        assert_eq!(message.extra.get("meta"), Some(&json!({"a": 1})));
    }
}
