//! Protocol module containing the message envelope and payload types.

pub mod envelope;
pub mod messages;

pub use envelope::{decode_envelope, validate_envelope, Envelope, MessageKind, ProtocolError};
pub use messages::*;
