//! WebSocket transport, wire schema and message routing

pub mod handler;
pub mod protocol;
pub mod router;
