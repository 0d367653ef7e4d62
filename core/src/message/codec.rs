// Message codec: JSON framing with size limits to prevent abuse

use super::types::{Envelope, KNOWN_MESSAGE_TYPES};
use serde_json::Value;
use thiserror::Error;

/// Maximum encoded envelope size: 256 KB
/// This prevents memory exhaustion from malicious oversized frames.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Message too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },
    #[error("Message is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Message has no type")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Malformed {message_type} message: {reason}")]
    Malformed { message_type: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Serialize an Envelope to a JSON text frame
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    let text =
        serde_json::to_string(envelope).map_err(|e| CodecError::Serialization(e.to_string()))?;

    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversized {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(text)
}

/// Parse a JSON text frame into an Envelope.
///
/// Distinguishes frames that are not JSON, frames with a `type` this node does
/// not understand, and known types whose fields do not match.
pub fn decode_envelope(raw: &str) -> Result<Envelope, CodecError> {
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversized {
            size: raw.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();

    if !KNOWN_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(CodecError::UnknownType(message_type));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed {
        message_type,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use crate::message::types::Payload;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(
            "dev-a",
            Payload::Heartbeat {
                device_info: DeviceInfo::new("dev-a", "Alpha", "mobile"),
            },
        );

        let text = encode_envelope(&envelope).unwrap();
        let restored = decode_envelope(&text).unwrap();

        assert_eq!(envelope, restored);
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big = format!(r#"{{"type":"error","message":"{}"}}"#, "x".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(
            decode_envelope(&big),
            Err(CodecError::Oversized { .. })
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            decode_envelope("{not json"),
            Err(CodecError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_missing_and_unknown_type() {
        assert!(matches!(
            decode_envelope(r#"{"from":"a"}"#),
            Err(CodecError::MissingType)
        ));
        match decode_envelope(r#"{"type":"telemetry","from":"a"}"#) {
            Err(CodecError::UnknownType(t)) => assert_eq!(t, "telemetry"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_known_type_with_bad_fields() {
        match decode_envelope(r#"{"type":"alert","from":"a","hops":"many"}"#) {
            Err(CodecError::Malformed { message_type, .. }) => assert_eq!(message_type, "alert"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }
}
