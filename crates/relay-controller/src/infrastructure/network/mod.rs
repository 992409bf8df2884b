//! Network infrastructure: the WebSocket control server and UDP discovery.

pub mod discovery;
pub mod server;
