//! Key press executors.
//!
//! The OS-level injection mechanism is an external collaborator: the
//! application layer only sees the [`KeyPressExecutor`] trait.  This module
//! provides the two executors shipped with the binary:
//!
//! - [`LoggingKeyPressExecutor`] — the headless default.  It logs each press
//!   and reports success, which is enough to exercise the whole control
//!   protocol end to end without a display server.
//! - [`MockKeyPressExecutor`] — a recording executor for tests.  It is not
//!   behind `cfg(test)` because integration tests in `tests/` need it too.

use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

use crate::application::execute_command::{KeyPressError, KeyPressExecutor};

/// Headless executor: logs the press and sleeps through the hold time.
#[derive(Debug, Default)]
pub struct LoggingKeyPressExecutor;

impl KeyPressExecutor for LoggingKeyPressExecutor {
    fn press(&self, key: &str, repeat: u32, hold_time_ms: u64) -> Result<bool, KeyPressError> {
        for i in 0..repeat {
            info!(key, press = i + 1, of = repeat, "simulated key press");
            if hold_time_ms > 0 {
                std::thread::sleep(Duration::from_millis(hold_time_ms));
            }
        }
        Ok(true)
    }
}

/// Recording executor for tests.
///
/// Records every `(key, repeat, hold_time_ms)` tuple.  Failure modes are
/// switched on with the builder methods:
///
/// - [`Self::with_reported_failure`] — `press` runs but returns `Ok(false)`,
///   the "platform said no" case.
/// - [`Self::with_error`] — `press` returns an error, the internal-fault
///   case.
#[derive(Debug, Default)]
pub struct MockKeyPressExecutor {
    presses: Mutex<Vec<(String, u32, u64)>>,
    report_failure: bool,
    should_error: bool,
}

impl MockKeyPressExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reported_failure(mut self) -> Self {
        self.report_failure = true;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.should_error = true;
        self
    }

    /// Snapshot of every recorded press.
    pub fn presses(&self) -> Vec<(String, u32, u64)> {
        self.presses.lock().expect("mock lock").clone()
    }
}

impl KeyPressExecutor for MockKeyPressExecutor {
    fn press(&self, key: &str, repeat: u32, hold_time_ms: u64) -> Result<bool, KeyPressError> {
        if self.should_error {
            return Err(KeyPressError::Platform("injected failure".to_string()));
        }
        self.presses
            .lock()
            .expect("mock lock")
            .push((key.to_string(), repeat, hold_time_ms));
        Ok(!self.report_failure)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_executor_reports_success() {
        let executor = LoggingKeyPressExecutor;
        assert!(executor.press("left", 2, 0).unwrap());
    }

    #[test]
    fn test_mock_records_presses_in_order() {
        let executor = MockKeyPressExecutor::new();
        executor.press("left", 1, 0).unwrap();
        executor.press("right", 2, 50).unwrap();
        assert_eq!(
            executor.presses(),
            vec![("left".to_string(), 1, 0), ("right".to_string(), 2, 50)]
        );
    }

    #[test]
    fn test_mock_reported_failure_still_records() {
        let executor = MockKeyPressExecutor::new().with_reported_failure();
        assert!(!executor.press("left", 1, 0).unwrap());
        assert_eq!(executor.presses().len(), 1);
    }

    #[test]
    fn test_mock_error_records_nothing() {
        let executor = MockKeyPressExecutor::new().with_error();
        assert!(executor.press("left", 1, 0).is_err());
        assert!(executor.presses().is_empty());
    }
}
