//! relay-controller library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the controller do? (for beginners)
//!
//! The *controller* is the orchestrating peer.  It accepts WebSocket
//! sessions from targets, keeps the authoritative registry of every device
//! it has seen, runs the token pairing handshake, and dispatches arrow-key
//! commands to paired targets.  A periodic liveness sweep pings every open
//! connection and terminates the ones that stopped answering.
//!
//! Optionally it also broadcasts UDP `announce` frames so targets on the
//! same LAN can find its control port without configuration.

/// Application layer: the device registry and its events.
pub mod application;

/// Infrastructure layer: control server and UDP discovery.
pub mod infrastructure;

pub use application::registry::{
    DeviceRegistry, DeviceStatus, PairError, RegisteredDevice, RegistryEvent,
};
pub use infrastructure::network::server::{
    ControlServer, DispatchError, ServerConfig, ServerEvent,
};
