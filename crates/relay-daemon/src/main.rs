//! # relay-daemon
//!
//! Relay daemon binary: wires settings, logging, metrics, the event bus,
//! the WebSocket server and the file service, then runs until Ctrl-C.

#![deny(unsafe_code)]

mod files;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::EventBus;
use relay_server::{CorrelationConfig, RelayServer, ServerConfig};
use relay_settings::RelaySettings;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::files::FileService;

/// How long shutdown waits for server tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay daemon.
#[derive(Parser, Debug)]
#[command(name = "relay-daemon", about = "WebSocket relay daemon")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory exposed by the file service. Repeatable.
    #[arg(long = "root")]
    roots: Vec<PathBuf>,

    /// Log filter, e.g. `debug` or `relay_server=trace` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, mut settings: RelaySettings) -> RelaySettings {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if !self.roots.is_empty() {
            settings.files.roots = self.roots.iter().map(|r| r.display().to_string()).collect();
        }
        settings
    }
}

fn server_config(settings: &RelaySettings) -> ServerConfig {
    let server = &settings.server;
    let correlation = &settings.correlation;
    ServerConfig {
        host: server.host.clone(),
        port: server.port,
        max_connections: server.max_connections,
        heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
        heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
        max_message_size: server.max_message_size,
        send_queue_capacity: server.send_queue_capacity,
        write_timeout: Duration::from_secs(server.write_timeout_secs),
        correlation: CorrelationConfig {
            capacity: correlation.capacity,
            idle_expiry: Duration::from_secs(correlation.idle_expiry_secs),
            shards: correlation.shards,
            sweep_interval: Duration::from_secs(correlation.sweep_interval_secs),
        },
    }
}

/// Canonical watched roots; the working directory when none are configured.
fn resolve_roots(settings: &RelaySettings) -> Result<Vec<PathBuf>> {
    let configured: Vec<PathBuf> = if settings.files.roots.is_empty() {
        vec![std::env::current_dir().context("Failed to read working directory")?]
    } else {
        settings.files.roots.iter().map(PathBuf::from).collect()
    };
    configured
        .into_iter()
        .map(|root| {
            root.canonicalize()
                .with_context(|| format!("Watched root not found: {}", root.display()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(relay_settings::settings_path);
    let settings = relay_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    let settings = cli.apply(settings);

    relay_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    info!(path = %settings_path.display(), "settings loaded");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let bus = EventBus::new(settings.bus.capacity);
    let roots = resolve_roots(&settings)?;
    for root in &roots {
        info!(root = %root.display(), "watching");
    }

    let files_cancel = CancellationToken::new();
    let files_task = FileService::new(roots, bus.clone())
        .with_max_file_size(settings.files.max_file_size)
        .spawn(files_cancel.clone());

    let server = RelayServer::new(server_config(&settings), bus).with_metrics(metrics);
    let handle = server.start().await.context("Failed to start server")?;

    info!(port = handle.port(), "relay daemon started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    handle.shutdown(SHUTDOWN_TIMEOUT).await;
    files_cancel.cancel();
    let _ = files_task.await;
    info!("relay daemon stopped");
    Ok(())
}
