//! The Arrow-Relay message envelope and its validation rules.
//!
//! Every frame on the control channel is a single JSON object:
//!
//! ```json
//! {"type":"register","version":"1.0.0","timestamp":1724900000000,
//!  "sender":{"id":"t1","type":"target"},"data":{...}}
//! ```
//!
//! # Validation order
//!
//! Inbound frames are checked field-by-field **in declaration order** before
//! any payload decoding happens, and a rejection always names the *first*
//! violated constraint.  This keeps error replies deterministic: a frame
//! missing both `version` and `sender` is reported for `version`.
//!
//! # Why validate on a raw `serde_json::Value`? (for beginners)
//!
//! Deserializing straight into a typed struct would also catch missing
//! fields, but serde reports them in an unspecified order and with messages
//! we do not control.  Validating the raw JSON value first gives us stable,
//! protocol-level error text; the typed deserialization afterwards can then
//! never fail on structure, only on payload shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::messages::DeviceType;

/// Current protocol version string, carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Error type for envelope encoding, decoding, and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not a JSON object at all.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// A required envelope field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A required envelope field is present but invalid.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    /// The `type` field names no known message kind.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    /// The payload in `data` does not match the shape for this message kind.
    #[error("invalid payload for `{kind}`: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// All message kinds defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Announce,
    Register,
    Registered,
    PairingRequest,
    PairingResponse,
    Command,
    CommandResult,
    Heartbeat,
    HeartbeatAck,
    Error,
}

impl MessageKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Announce => "announce",
            MessageKind::Register => "register",
            MessageKind::Registered => "registered",
            MessageKind::PairingRequest => "pairing_request",
            MessageKind::PairingResponse => "pairing_response",
            MessageKind::Command => "command",
            MessageKind::CommandResult => "command_result",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::HeartbeatAck => "heartbeat_ack",
            MessageKind::Error => "error",
        }
    }

    /// Parses a wire name into a kind, returning `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "announce" => Some(MessageKind::Announce),
            "register" => Some(MessageKind::Register),
            "registered" => Some(MessageKind::Registered),
            "pairing_request" => Some(MessageKind::PairingRequest),
            "pairing_response" => Some(MessageKind::PairingResponse),
            "command" => Some(MessageKind::Command),
            "command_result" => Some(MessageKind::CommandResult),
            "heartbeat" => Some(MessageKind::Heartbeat),
            "heartbeat_ack" => Some(MessageKind::HeartbeatAck),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Identity block carried in every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Stable, peer-generated device identity.
    pub id: String,
    /// Role of the sending peer.
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

/// The envelope wrapped around every payload on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Discriminant selecting the payload shape in `data`.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Semantic-version string; currently always [`PROTOCOL_VERSION`].
    pub version: String,
    /// Milliseconds since the Unix epoch at time of sending.
    pub timestamp: u64,
    /// Identity of the sending peer.
    pub sender: Sender,
    /// Payload object, keyed by `kind`.  Empty object for payload-free kinds
    /// such as `heartbeat`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Builds an envelope stamped with the current protocol version and time.
    pub fn new(kind: MessageKind, sender: Sender, data: Value) -> Self {
        Self {
            kind,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: current_timestamp_ms(),
            sender,
            data,
        }
    }

    /// Serializes the envelope to the single-line JSON wire form.
    pub fn encode(&self) -> String {
        // Envelope is a plain data struct with no non-serializable fields,
        // so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes the `data` payload into the typed struct for this kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] when `data` does not match
    /// the expected shape.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind.as_str(),
            reason: e.to_string(),
        })
    }
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Validates the envelope fields of a raw JSON frame, in declaration order.
///
/// # Errors
///
/// Returns the error for the **first** violated constraint:
/// object-ness, `type`, `version`, `timestamp`, `sender`, `sender.id`,
/// `sender.type`.
pub fn validate_envelope(raw: &Value) -> Result<MessageKind, ProtocolError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("frame is not a JSON object".to_string()))?;

    let kind_str = match obj.get("type") {
        None => return Err(ProtocolError::MissingField("type")),
        Some(v) => v.as_str().ok_or_else(|| ProtocolError::InvalidField {
            field: "type",
            reason: "must be a string".to_string(),
        })?,
    };
    let kind =
        MessageKind::parse(kind_str).ok_or_else(|| ProtocolError::UnknownType(kind_str.into()))?;

    match obj.get("version") {
        None => return Err(ProtocolError::MissingField("version")),
        Some(v) => {
            let s = v.as_str().ok_or_else(|| ProtocolError::InvalidField {
                field: "version",
                reason: "must be a string".to_string(),
            })?;
            if s.is_empty() {
                return Err(ProtocolError::InvalidField {
                    field: "version",
                    reason: "must not be empty".to_string(),
                });
            }
        }
    }

    match obj.get("timestamp") {
        None => return Err(ProtocolError::MissingField("timestamp")),
        Some(v) => match v.as_u64() {
            Some(ts) if ts > 0 => {}
            _ => {
                return Err(ProtocolError::InvalidField {
                    field: "timestamp",
                    reason: "must be a positive integer".to_string(),
                })
            }
        },
    }

    let sender = match obj.get("sender") {
        None => return Err(ProtocolError::MissingField("sender")),
        Some(v) => v.as_object().ok_or_else(|| ProtocolError::InvalidField {
            field: "sender",
            reason: "must be an object".to_string(),
        })?,
    };

    match sender.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => {}
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "sender.id",
                reason: "must not be empty".to_string(),
            })
        }
        None => return Err(ProtocolError::MissingField("sender.id")),
    }

    match sender.get("type").and_then(Value::as_str) {
        Some("controller") | Some("target") => {}
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "sender.type",
                reason: format!("unknown sender type `{other}`"),
            })
        }
        None => return Err(ProtocolError::MissingField("sender.type")),
    }

    Ok(kind)
}

/// Parses and validates a wire frame into an [`Envelope`].
///
/// # Errors
///
/// Returns [`ProtocolError`] citing the first violated constraint.
pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    validate_envelope(&raw)?;
    // Structural validation passed, so typed deserialization of the envelope
    // itself cannot fail; any remaining mismatch is a payload-shape problem
    // surfaced later by `Envelope::payload`.
    serde_json::from_value(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> Sender {
        Sender {
            id: "t1".to_string(),
            device_type: DeviceType::Target,
        }
    }

    #[test]
    fn test_encode_decode_round_trip_preserves_envelope() {
        // Arrange
        let env = Envelope::new(MessageKind::Heartbeat, sender(), json!({}));

        // Act
        let decoded = decode_envelope(&env.encode()).expect("decode");

        // Assert
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_rejects_non_object_frame() {
        let result = decode_envelope("[1,2,3]");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_missing_type_first() {
        // Both `type` and `version` are missing; the rejection must cite `type`.
        let frame = json!({"timestamp": 1, "sender": {"id": "x", "type": "target"}});
        let result = decode_envelope(&frame.to_string());
        assert_eq!(result, Err(ProtocolError::MissingField("type")));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let frame = json!({
            "type": "teleport", "version": "1.0.0", "timestamp": 1,
            "sender": {"id": "x", "type": "target"}
        });
        let result = decode_envelope(&frame.to_string());
        assert_eq!(result, Err(ProtocolError::UnknownType("teleport".into())));
    }

    #[test]
    fn test_decode_rejects_empty_version() {
        let frame = json!({
            "type": "heartbeat", "version": "", "timestamp": 1,
            "sender": {"id": "x", "type": "target"}
        });
        let result = decode_envelope(&frame.to_string());
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField { field: "version", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_zero_timestamp() {
        let frame = json!({
            "type": "heartbeat", "version": "1.0.0", "timestamp": 0,
            "sender": {"id": "x", "type": "target"}
        });
        let result = decode_envelope(&frame.to_string());
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField { field: "timestamp", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_missing_sender() {
        let frame = json!({"type": "heartbeat", "version": "1.0.0", "timestamp": 1});
        let result = decode_envelope(&frame.to_string());
        assert_eq!(result, Err(ProtocolError::MissingField("sender")));
    }

    #[test]
    fn test_decode_rejects_unknown_sender_type() {
        let frame = json!({
            "type": "heartbeat", "version": "1.0.0", "timestamp": 1,
            "sender": {"id": "x", "type": "observer"}
        });
        let result = decode_envelope(&frame.to_string());
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField { field: "sender.type", .. })
        ));
    }

    #[test]
    fn test_missing_data_defaults_to_null_payload() {
        // `data` is optional on the wire; payload-free kinds omit it.
        let frame = json!({
            "type": "heartbeat_ack", "version": "1.0.0", "timestamp": 1,
            "sender": {"id": "c1", "type": "controller"}
        });
        let env = decode_envelope(&frame.to_string()).expect("decode");
        assert_eq!(env.kind, MessageKind::HeartbeatAck);
        assert!(env.data.is_null());
    }

    #[test]
    fn test_message_kind_parse_round_trips_all_kinds() {
        let kinds = [
            MessageKind::Announce,
            MessageKind::Register,
            MessageKind::Registered,
            MessageKind::PairingRequest,
            MessageKind::PairingResponse,
            MessageKind::Command,
            MessageKind::CommandResult,
            MessageKind::Heartbeat,
            MessageKind::HeartbeatAck,
            MessageKind::Error,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_current_timestamp_ms_is_positive() {
        assert!(current_timestamp_ms() > 0);
    }
}
