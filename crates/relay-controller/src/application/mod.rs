//! Application layer for the controller.

pub mod registry;
