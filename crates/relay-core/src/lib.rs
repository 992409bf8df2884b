//! # relay-core
//!
//! Shared library for Arrow-Relay containing the wire protocol types,
//! envelope validation rules, and the token/address utilities used by both
//! roles.
//!
//! This crate is used by both the controller and target applications.
//! It has zero dependencies on sockets, timers, or OS input APIs.
//!
//! # Architecture overview (for beginners)
//!
//! Arrow-Relay lets one *controller* process send simulated left/right
//! arrow-key presses to one or more *target* processes on the same LAN.
//! The two roles exchange JSON messages over a WebSocket control channel:
//!
//! - **`protocol`** – The message envelope (`type`, `version`, `timestamp`,
//!   `sender`, `data`) and every payload shape: registration, the pairing
//!   handshake, commands and their results, heartbeats, and errors.  Inbound
//!   frames are validated field-by-field before any payload is decoded.
//!
//! - **`token`** – Cryptographically random fixed-length secrets used for
//!   the one-time pairing token and the auth token issued on success.
//!
//! - **`net_util`** – Best-effort local IPv4 resolution, used when a peer
//!   advertises its own address in a `register` or `announce` message.

pub mod net_util;
pub mod protocol;
pub mod token;

// Re-export the most-used types at the crate root so callers can write
// `relay_core::Envelope` instead of `relay_core::protocol::envelope::Envelope`.
pub use protocol::envelope::{
    current_timestamp_ms, decode_envelope, validate_envelope, Envelope, MessageKind,
    ProtocolError, Sender, PROTOCOL_VERSION,
};
pub use protocol::messages::{
    AnnouncePayload, CommandParameters, CommandPayload, CommandResultPayload, CommandType,
    DeviceInfo, DeviceType, ErrorCode, ErrorPayload, PairingRequestPayload,
    PairingResponsePayload, RegisterPayload, RegisteredPayload, CONTROLLER_DISCOVERY_PORT,
    DEFAULT_CONTROL_PORT, TARGET_DISCOVERY_PORT,
};
pub use net_util::local_ipv4;
pub use token::{generate_token, TOKEN_LEN};
