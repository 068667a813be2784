//! # relay-server
//!
//! axum WebSocket transport with request/response correlation.
//!
//! - `GET /api/ws`: one session per client; text frames are decoded into
//!   requests, correlated with their connection and published on the bus
//! - Outbound dispatch: correlated responses go to the originating
//!   connection, everything else is broadcast to all connections
//! - `GET /api/rest`, `GET /health`, `GET /metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod health;
pub mod server;
pub mod websocket;

pub use config::{CorrelationConfig, ServerConfig};
pub use correlation::CorrelationCache;
pub use dispatch::{Delivery, Dispatcher, RequestCache};
pub use server::{RelayServer, SHUTDOWN_MESSAGE, ServerHandle};
pub use websocket::connection::{ClientConnection, ConnectionState, DeliveryError};
pub use websocket::registry::ConnectionRegistry;
