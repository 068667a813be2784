//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "correlation": { "idleExpirySecs": 120 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener and per-connection settings.
    pub server: ServerSettings,
    /// Request → connection correlation cache.
    pub correlation: CorrelationSettings,
    /// In-process event bus.
    pub bus: BusSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Demo file service.
    pub files: FileServiceSettings,
}

impl RelaySettings {
    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.correlation.capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "correlation.capacity must be greater than 0".into(),
            ));
        }
        if self.correlation.shards == 0 {
            return Err(SettingsError::InvalidValue(
                "correlation.shards must be greater than 0".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than 0".into(),
            ));
        }
        if self.server.write_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.writeTimeoutSecs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and per-connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the connection is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Seconds a single socket write may take before the client is dropped.
    pub write_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8080,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024,
            send_queue_capacity: 256,
            write_timeout_secs: 10,
        }
    }
}

/// Correlation cache settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrelationSettings {
    /// Maximum tracked requests.
    pub capacity: usize,
    /// Seconds an entry survives without being read or written.
    pub idle_expiry_secs: u64,
    /// Lock stripes.
    pub shards: usize,
    /// Seconds between background purges of expired entries.
    pub sweep_interval_secs: u64,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            idle_expiry_secs: 60,
            shards: 2,
            sweep_interval_secs: 30,
        }
    }
}

/// Event bus settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Events buffered per subscriber and topic.
    pub capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Demo file service settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileServiceSettings {
    /// Directories exposed to clients. Empty means the working directory.
    pub roots: Vec<String>,
    /// Largest file `get-file` will send, in bytes.
    pub max_file_size: u64,
}

impl Default for FileServiceSettings {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            max_file_size: 8 * 1024 * 1024,
        }
    }
}
