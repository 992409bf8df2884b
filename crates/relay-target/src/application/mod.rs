//! Application layer for the target: command execution use case.

pub mod execute_command;
