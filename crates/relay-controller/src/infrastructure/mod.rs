//! Infrastructure layer: network services for the controller.

pub mod network;
