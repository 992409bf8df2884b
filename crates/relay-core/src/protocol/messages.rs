//! All Arrow-Relay payload types and protocol constants.
//!
//! Payload objects use camelCase field names on the wire, matching the JSON
//! envelope convention.  Each message kind in
//! [`MessageKind`](crate::MessageKind) with a payload has one struct here.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Default TCP port for the WebSocket control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 8080;

/// UDP port the controller's discovery socket binds; targets broadcast raw
/// `register` frames here.
pub const CONTROLLER_DISCOVERY_PORT: u16 = 3000;

/// UDP port targets listen on for controller `announce` broadcasts.
pub const TARGET_DISCOVERY_PORT: u16 = 8081;

// ── Device identity ───────────────────────────────────────────────────────────

/// Role of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Controller,
    Target,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Controller => "controller",
            DeviceType::Target => "target",
        }
    }
}

/// Command identifiers a target may advertise and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    ArrowLeft,
    ArrowRight,
}

impl CommandType {
    /// Returns the wire name of this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::ArrowLeft => "arrow_left",
            CommandType::ArrowRight => "arrow_right",
        }
    }

    /// Returns the key name handed to the OS key-press capability.
    pub fn key_name(&self) -> &'static str {
        match self {
            CommandType::ArrowLeft => "left",
            CommandType::ArrowRight => "right",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a peer generates at startup and advertises in `register` and
/// `announce` messages.
///
/// The `id` is stable for the peer's lifetime but regenerated across process
/// restarts; the controller's registry reconciles restarts by `ip`/`mac`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub supported_commands: Vec<CommandType>,
}

impl DeviceInfo {
    /// Returns `true` if this device advertises the given command.
    pub fn supports(&self, command: CommandType) -> bool {
        self.supported_commands.contains(&command)
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// `announce`: UDP broadcast advertising a controller's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    /// Identity of the announcing controller.
    pub controller: DeviceInfo,
    /// UDP port the controller's discovery socket is bound to.
    pub discovery_port: u16,
    /// TCP port of the controller's WebSocket control channel.
    pub control_port: u16,
}

/// `register`: a target introduces its identity to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub device: DeviceInfo,
}

/// `registered`: controller reply to `register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub device_id: String,
    /// `true` when the device must complete the pairing handshake before it
    /// may receive commands.
    pub pairing_required: bool,
    /// One-time pairing token; present iff `pairing_required`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_token: Option<String>,
}

/// `pairing_request`: a target echoes its pairing token back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestPayload {
    pub pairing_token: String,
}

/// `pairing_response`: controller verdict on a `pairing_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponsePayload {
    pub accepted: bool,
    /// Opaque auth token; present iff `accepted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_repeat() -> u32 {
    1
}

/// Parameters of an arrow command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParameters {
    /// Number of discrete key taps; positive, default 1.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Press-and-hold duration in milliseconds; 0 (the default) means an
    /// instantaneous tap.
    #[serde(default)]
    pub hold_time: u64,
}

impl Default for CommandParameters {
    fn default() -> Self {
        Self {
            repeat: 1,
            hold_time: 0,
        }
    }
}

/// `command`: controller dispatches an arrow-key press to a paired target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_type: CommandType,
    #[serde(default)]
    pub parameters: CommandParameters,
}

/// `command_result`: asynchronous execution outcome, correlated by
/// (sender device id, `command_type`).  The protocol carries no request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub command_type: CommandType,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Stable numeric error codes carried in `error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    InvalidMessage = 1,
    AuthenticationFailed = 2,
    InvalidCommand = 3,
    InternalError = 4,
    NotPaired = 5,
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::InvalidMessage),
            2 => Ok(ErrorCode::AuthenticationFailed),
            3 => Ok(ErrorCode::InvalidCommand),
            4 => Ok(ErrorCode::InternalError),
            5 => Ok(ErrorCode::NotPaired),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

/// `error`: synchronous protocol-level rejection; the connection stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_parameters_default_when_absent() {
        // Arrange: a command payload with no parameters object at all.
        let raw = json!({"commandType": "arrow_left"});

        // Act
        let payload: CommandPayload = serde_json::from_value(raw).expect("decode");

        // Assert
        assert_eq!(payload.parameters.repeat, 1);
        assert_eq!(payload.parameters.hold_time, 0);
    }

    #[test]
    fn test_command_parameters_partial_defaults() {
        let raw = json!({"commandType": "arrow_right", "parameters": {"repeat": 3}});
        let payload: CommandPayload = serde_json::from_value(raw).expect("decode");
        assert_eq!(payload.command_type, CommandType::ArrowRight);
        assert_eq!(payload.parameters.repeat, 3);
        assert_eq!(payload.parameters.hold_time, 0);
    }

    #[test]
    fn test_command_serializes_camel_case_fields() {
        let payload = CommandPayload {
            command_type: CommandType::ArrowLeft,
            parameters: CommandParameters {
                repeat: 2,
                hold_time: 0,
            },
        };
        let raw = serde_json::to_value(&payload).expect("encode");
        assert_eq!(raw["commandType"], "arrow_left");
        assert_eq!(raw["parameters"]["repeat"], 2);
        assert_eq!(raw["parameters"]["holdTime"], 0);
    }

    #[test]
    fn test_error_code_serializes_as_stable_integer() {
        let payload = ErrorPayload {
            code: ErrorCode::NotPaired,
            message: "device is not paired".to_string(),
        };
        let raw = serde_json::to_value(&payload).expect("encode");
        assert_eq!(raw["code"], 5);
    }

    #[test]
    fn test_error_code_rejects_unknown_integer() {
        let result: Result<ErrorCode, _> = serde_json::from_value(json!(99));
        assert!(result.is_err());
    }

    #[test]
    fn test_device_info_omits_absent_mac() {
        let info = DeviceInfo {
            id: "t1".to_string(),
            name: "desk".to_string(),
            ip: "192.168.1.20".parse().unwrap(),
            mac: None,
            device_type: DeviceType::Target,
            supported_commands: vec![CommandType::ArrowLeft],
        };
        let raw = serde_json::to_value(&info).expect("encode");
        assert!(raw.get("mac").is_none());
        assert_eq!(raw["type"], "target");
        assert_eq!(raw["supportedCommands"][0], "arrow_left");
    }

    #[test]
    fn test_device_info_supports_checks_advertised_set() {
        let info = DeviceInfo {
            id: "t1".to_string(),
            name: "desk".to_string(),
            ip: "192.168.1.20".parse().unwrap(),
            mac: None,
            device_type: DeviceType::Target,
            supported_commands: vec![CommandType::ArrowLeft],
        };
        assert!(info.supports(CommandType::ArrowLeft));
        assert!(!info.supports(CommandType::ArrowRight));
    }

    #[test]
    fn test_command_type_key_names() {
        assert_eq!(CommandType::ArrowLeft.key_name(), "left");
        assert_eq!(CommandType::ArrowRight.key_name(), "right");
    }
}
