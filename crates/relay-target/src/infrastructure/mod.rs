//! Infrastructure layer: key press executors, the control client, and the
//! discovery probe.

pub mod discovery;
pub mod keypress;
pub mod network;
