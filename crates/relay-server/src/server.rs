//! `RelayServer`: axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{ConnectionId, EventBus, Response as RelayResponse, ResponseBody};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{Delivery, Dispatcher, RequestCache};
use crate::health::{self, HealthResponse};
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{SessionContext, run_session};

/// Notification broadcast to every client when the server shuts down.
pub const SHUTDOWN_MESSAGE: &str = "server shutting down";

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Handed to every WebSocket session.
    pub session: Arc<SessionContext>,
    /// One permit per allowed connection, held for the session's lifetime.
    pub connection_slots: Arc<Semaphore>,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus renderer, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<RequestCache>,
    connection_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server publishing requests on `bus` and dispatching
    /// responses from it.
    pub fn new(config: ServerConfig, bus: EventBus) -> Self {
        let cache = Arc::new(RequestCache::new(&config.correlation));
        let connection_slots = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config,
            bus,
            registry: Arc::new(ConnectionRegistry::new()),
            cache,
            connection_slots,
            shutdown: CancellationToken::new(),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let session = Arc::new(SessionContext {
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            bus: self.bus.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
            send_queue_capacity: self.config.send_queue_capacity,
            write_timeout: self.config.write_timeout,
            shutdown: self.shutdown.clone(),
        });
        let state = AppState {
            session,
            connection_slots: Arc::clone(&self.connection_slots),
            max_message_size: self.config.max_message_size,
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/api/ws", get(ws_handler))
            .route("/api/rest", get(rest_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Dispatcher over this server's cache and registry.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.cache), Arc::clone(&self.registry))
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Correlation cache.
    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and spawn the server, the dispatcher and the cache
    /// sweeper.
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;

        let dispatcher = self.dispatcher();
        let dispatch_task = tokio::spawn(
            dispatcher
                .clone()
                .run(self.bus.subscribe_outbound(), self.shutdown.clone()),
        );
        let sweeper = Arc::clone(&self.cache)
            .spawn_sweeper(self.config.correlation.sweep_interval, self.shutdown.clone());

        let router = self.router();
        let stop = self.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        });

        info!(%addr, "relay server listening");
        Ok(ServerHandle {
            addr,
            dispatcher,
            shutdown: self.shutdown,
            tasks: vec![server, dispatch_task, sweeper],
        })
    }
}

/// Running server.
pub struct ServerHandle {
    addr: SocketAddr,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port (useful when configured with port 0).
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tell connected clients the server is going away, stop accepting
    /// connections, end every session and wait up to `timeout` for the server
    /// tasks to finish.
    ///
    /// Sessions flush the notice before closing their sockets.
    pub async fn shutdown(self, timeout: Duration) {
        let notice = RelayResponse::broadcast(ResponseBody::Notification {
            message: SHUTDOWN_MESSAGE.into(),
        });
        if let Delivery::Broadcast { recipients, failed } =
            self.dispatcher.dispatch_response(&notice)
        {
            info!(recipients, failed, "shutdown notice queued");
        }
        self.shutdown.cancel();
        info!(
            task_count = self.tasks.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for server tasks to complete"
        );

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

/// GET /api/ws
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Ok(slot) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        warn!(
            live = state.session.registry.len(),
            "connection limit reached, rejecting upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let ctx = Arc::clone(&state.session);
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let (ws_tx, ws_rx) = socket.split();
            run_session(ConnectionId::new(), ws_tx, ws_rx, ctx).await;
            drop(slot);
        })
}

/// GET /api/rest
async fn rest_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Hello World" }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.session.registry.len(),
        state.session.cache.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
