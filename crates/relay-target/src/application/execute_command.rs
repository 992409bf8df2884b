//! ExecuteCommandUseCase: translates inbound `command` messages into key
//! presses.
//!
//! This use case sits at the application layer and delegates to a
//! [`KeyPressExecutor`] trait object for the actual key injection.  The
//! executors live in the infrastructure layer; tests inject a recording
//! mock.
//!
//! Every outcome — including "I don't know that command" — is reported back
//! to the controller as a `command_result`, so failures on the target are
//! observable rather than silent.

use std::sync::Arc;

use relay_core::{CommandPayload, CommandResultPayload, CommandType};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for key press execution.
#[derive(Debug, Error)]
pub enum KeyPressError {
    #[error("platform error: {0}")]
    Platform(String),
    #[error("executor not available")]
    NotAvailable,
}

/// Platform-agnostic key press capability.
///
/// `press` simulates `repeat` presses of the named key, holding each for
/// `hold_time_ms` milliseconds.  `Ok(true)` means every press was delivered;
/// `Ok(false)` means the platform reported a delivery failure.
pub trait KeyPressExecutor: Send + Sync {
    fn press(&self, key: &str, repeat: u32, hold_time_ms: u64) -> Result<bool, KeyPressError>;
}

/// The Execute Command use case.
///
/// Receives decoded `command` payloads and produces the `command_result`
/// payload the client sends back.
pub struct ExecuteCommandUseCase {
    executor: Arc<dyn KeyPressExecutor>,
    /// Commands this target advertises; anything else is refused before the
    /// executor is touched.
    supported: Vec<CommandType>,
}

impl ExecuteCommandUseCase {
    /// Creates a new use case with the given executor and advertised
    /// command set.
    pub fn new(executor: Arc<dyn KeyPressExecutor>, supported: Vec<CommandType>) -> Self {
        Self { executor, supported }
    }

    /// Executes one command and returns the result to report.
    ///
    /// Executor failures are caught here and reported as a generic internal
    /// error; they never propagate out of the use case.
    pub fn execute(&self, payload: &CommandPayload) -> CommandResultPayload {
        let command = payload.command_type;
        if !self.supported.contains(&command) {
            warn!(command = %command, "command not advertised by this target");
            return CommandResultPayload {
                command_type: command,
                success: false,
                error: Some("Unsupported command".to_string()),
            };
        }
        let key = command.key_name();

        let params = &payload.parameters;
        debug!(
            command = %command,
            repeat = params.repeat,
            hold_time = params.hold_time,
            "executing command"
        );

        match self.executor.press(key, params.repeat, params.hold_time) {
            Ok(true) => CommandResultPayload {
                command_type: command,
                success: true,
                error: None,
            },
            Ok(false) => {
                warn!(command = %command, "key press reported failure");
                CommandResultPayload {
                    command_type: command,
                    success: false,
                    error: Some("Key press failed".to_string()),
                }
            }
            Err(e) => {
                warn!(command = %command, "executor error: {e}");
                CommandResultPayload {
                    command_type: command,
                    success: false,
                    error: Some("Internal error executing command".to_string()),
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
