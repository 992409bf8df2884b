//! Integration tests for the wire envelope and payload shapes.
//!
//! These tests exercise the protocol through its public API exactly as the
//! controller and target use it: encode an envelope to a JSON string, decode
//! it back, and pull out the typed payload.  They also pin down the JSON
//! field names that both roles (and any third-party peer) depend on.

use relay_core::{
    decode_envelope, CommandParameters, CommandPayload, CommandResultPayload, CommandType,
    DeviceInfo, DeviceType, Envelope, ErrorCode, MessageKind, PairingRequestPayload,
    ProtocolError, RegisterPayload, RegisteredPayload, Sender, PROTOCOL_VERSION,
};
use serde_json::json;

fn target_sender(id: &str) -> Sender {
    Sender {
        id: id.to_string(),
        device_type: DeviceType::Target,
    }
}

fn sample_device(id: &str) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: "test-target".to_string(),
        ip: "192.168.1.42".parse().unwrap(),
        mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
        device_type: DeviceType::Target,
        supported_commands: vec![CommandType::ArrowLeft, CommandType::ArrowRight],
    }
}

// ── Envelope round trips ──────────────────────────────────────────────────────

#[test]
fn test_register_envelope_round_trip() {
    // Arrange
    let payload = RegisterPayload {
        device: sample_device("t1"),
    };
    let env = Envelope::new(
        MessageKind::Register,
        target_sender("t1"),
        serde_json::to_value(&payload).unwrap(),
    );

    // Act
    let decoded = decode_envelope(&env.encode()).expect("decode");
    let round: RegisterPayload = decoded.payload().expect("payload");

    // Assert
    assert_eq!(decoded.kind, MessageKind::Register);
    assert_eq!(decoded.version, PROTOCOL_VERSION);
    assert_eq!(round.device, sample_device("t1"));
}

#[test]
fn test_command_envelope_matches_documented_wire_shape() {
    // The canonical dispatch frame: arrow_left with repeat 2, default hold.
    let payload = CommandPayload {
        command_type: CommandType::ArrowLeft,
        parameters: CommandParameters {
            repeat: 2,
            hold_time: 0,
        },
    };
    let env = Envelope::new(
        MessageKind::Command,
        Sender {
            id: "c1".to_string(),
            device_type: DeviceType::Controller,
        },
        serde_json::to_value(&payload).unwrap(),
    );

    let raw: serde_json::Value = serde_json::from_str(&env.encode()).unwrap();
    assert_eq!(raw["type"], "command");
    assert_eq!(raw["sender"]["type"], "controller");
    assert_eq!(raw["data"]["commandType"], "arrow_left");
    assert_eq!(raw["data"]["parameters"]["repeat"], 2);
    assert_eq!(raw["data"]["parameters"]["holdTime"], 0);
}

#[test]
fn test_command_result_payload_round_trip() {
    let payload = CommandResultPayload {
        command_type: CommandType::ArrowRight,
        success: false,
        error: Some("Unsupported command".to_string()),
    };
    let env = Envelope::new(
        MessageKind::CommandResult,
        target_sender("t1"),
        serde_json::to_value(&payload).unwrap(),
    );

    let decoded = decode_envelope(&env.encode()).expect("decode");
    let round: CommandResultPayload = decoded.payload().expect("payload");
    assert_eq!(round, payload);
}

#[test]
fn test_pairing_request_round_trip() {
    let payload = PairingRequestPayload {
        pairing_token: "abc".to_string(),
    };
    let env = Envelope::new(
        MessageKind::PairingRequest,
        target_sender("t1"),
        serde_json::to_value(&payload).unwrap(),
    );

    let decoded = decode_envelope(&env.encode()).expect("decode");
    let round: PairingRequestPayload = decoded.payload().expect("payload");
    assert_eq!(round.pairing_token, "abc");
}

// ── Validation ordering ───────────────────────────────────────────────────────

#[test]
fn test_validation_cites_first_violated_constraint() {
    // Frame with every problem at once: the reported error must be the
    // earliest field in validation order (`version` here; `type` is fine).
    let frame = json!({
        "type": "heartbeat",
        "timestamp": 0,
        "sender": {"id": "", "type": "nobody"}
    });
    let result = decode_envelope(&frame.to_string());
    assert_eq!(result, Err(ProtocolError::MissingField("version")));
}

#[test]
fn test_validation_reports_sender_id_before_sender_type() {
    let frame = json!({
        "type": "heartbeat", "version": "1.0.0", "timestamp": 5,
        "sender": {"id": "", "type": "nobody"}
    });
    let result = decode_envelope(&frame.to_string());
    assert!(matches!(
        result,
        Err(ProtocolError::InvalidField { field: "sender.id", .. })
    ));
}

// ── Payload shape errors ──────────────────────────────────────────────────────

#[test]
fn test_payload_mismatch_is_reported_per_kind() {
    let env = Envelope::new(
        MessageKind::Command,
        target_sender("t1"),
        json!({"commandType": "arrow_up"}),
    );
    let decoded = decode_envelope(&env.encode()).expect("envelope itself is valid");
    let result: Result<CommandPayload, _> = decoded.payload();
    assert!(matches!(
        result,
        Err(ProtocolError::InvalidPayload { kind: "command", .. })
    ));
}

#[test]
fn test_registered_payload_token_presence_tracks_pairing_required() {
    let unpaired = RegisteredPayload {
        device_id: "t1".to_string(),
        pairing_required: true,
        pairing_token: Some("abc".to_string()),
    };
    let raw = serde_json::to_value(&unpaired).unwrap();
    assert_eq!(raw["pairingRequired"], true);
    assert_eq!(raw["pairingToken"], "abc");

    let paired = RegisteredPayload {
        device_id: "t1".to_string(),
        pairing_required: false,
        pairing_token: None,
    };
    let raw = serde_json::to_value(&paired).unwrap();
    assert!(raw.get("pairingToken").is_none());
}

#[test]
fn test_error_codes_are_stable_integers() {
    assert_eq!(u16::from(ErrorCode::InvalidMessage), 1);
    assert_eq!(u16::from(ErrorCode::AuthenticationFailed), 2);
    assert_eq!(u16::from(ErrorCode::InvalidCommand), 3);
    assert_eq!(u16::from(ErrorCode::InternalError), 4);
    assert_eq!(u16::from(ErrorCode::NotPaired), 5);
}
