//! WebSocket connection management, heartbeat, inbound handling and fan-out.

pub mod connection;
pub mod handler;
pub mod registry;
pub mod session;
