//! Server configuration.

use std::time::Duration;

/// Correlation cache configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// Maximum tracked requests across all shards.
    pub capacity: usize,
    /// How long an entry survives without being read or written.
    pub idle_expiry: Duration,
    /// Lock stripes.
    pub shards: usize,
    /// Interval of the background purge.
    pub sweep_interval: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            idle_expiry: Duration::from_secs(60),
            shards: 2,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for the relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close the connection after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// A socket write taking longer than this closes the connection.
    pub write_timeout: Duration,
    /// Correlation cache.
    pub correlation: CorrelationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 64,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_message_size: 16 * 1024 * 1024, // 16 MB
            send_queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            correlation: CorrelationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
