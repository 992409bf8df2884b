//! relay-target library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does the target do? (for beginners)
//!
//! The *target* is the controlled peer.  It finds a controller (configured
//! address or UDP announce), opens a WebSocket session, registers its
//! identity, completes the token pairing handshake, and then executes the
//! arrow-key commands the controller dispatches, reporting each outcome
//! back.  A heartbeat loop keeps the session alive; if the transport drops,
//! the client reconnects with exponential backoff until a maximum attempt
//! count is reached.

/// Application layer: the command execution use case.
pub mod application;

/// Infrastructure layer: key press executors, control client, discovery.
pub mod infrastructure;

pub use application::execute_command::{ExecuteCommandUseCase, KeyPressError, KeyPressExecutor};
pub use infrastructure::keypress::{LoggingKeyPressExecutor, MockKeyPressExecutor};
pub use infrastructure::network::{
    delay_for_attempt, ClientConfig, ClientEvent, ClientState, ControlClient,
};
