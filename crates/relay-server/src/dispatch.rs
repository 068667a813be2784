//! Outbound dispatcher: routes responses from the bus to connections.
//!
//! A text response carrying a positive `requestId` goes only to the
//! connection the correlation cache maps that id to. Anything else
//! (absent, zero or negative id) is broadcast to every registered
//! connection. Binary responses are always correlated and never broadcast.
//! A correlated response whose id is unknown or expired is dropped with a
//! warning; it is never broadcast instead.

use std::sync::Arc;

use metrics::counter;
use relay_core::{BinaryResponse, ConnectionId, Outbound, RequestId, Response};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::correlation::CorrelationCache;
use crate::websocket::connection::ClientConnection;
use crate::websocket::registry::ConnectionRegistry;

/// Correlation cache keyed by request id, holding the originating connection.
pub type RequestCache = CorrelationCache<Arc<ClientConnection>>;

/// Outcome of dispatching one outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to every registered connection; `failed` of them rejected it.
    Broadcast {
        /// Connections visited.
        recipients: usize,
        /// Connections whose queue was full or closed.
        failed: usize,
    },
    /// Sent to the originating connection.
    Delivered(ConnectionId),
    /// No live correlation for the request id; dropped.
    Missed(RequestId),
    /// The originating connection was found but could not take the frame.
    Failed(ConnectionId),
    /// The response could not be serialized; dropped.
    Unserializable,
}

/// Routes outbound events to connections.
#[derive(Clone)]
pub struct Dispatcher {
    cache: Arc<RequestCache>,
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over a cache and a registry.
    pub fn new(cache: Arc<RequestCache>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { cache, registry }
    }

    /// Route one outbound event. Never blocks: a connection that cannot
    /// take the frame right now loses it, and other connections are not
    /// held up.
    pub fn dispatch(&self, event: Outbound) -> Delivery {
        match event {
            Outbound::Text(response) => self.dispatch_response(&response),
            Outbound::Binary(response) => self.dispatch_binary(response),
        }
    }

    /// Route a text response. Never blocks.
    pub fn dispatch_response(&self, response: &Response) -> Delivery {
        let kind = response.kind();
        let json = match serde_json::to_string(response) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(kind, error = %e, "failed to serialize response");
                return Delivery::Unserializable;
            }
        };

        let Some(request_id) = response.correlation() else {
            return self.broadcast(&json, kind);
        };

        let Some(conn) = self.cache.get(request_id) else {
            return miss(request_id, kind);
        };

        match conn.send_text(json) {
            Ok(()) => {
                debug!(%request_id, conn_id = %conn.id, kind, "response delivered");
                Delivery::Delivered(conn.id.clone())
            }
            Err(e) => {
                warn!(%request_id, conn_id = %conn.id, kind, error = %e, "failed to send response to client");
                Delivery::Failed(conn.id.clone())
            }
        }
    }

    /// Route a binary response to its originating connection.
    ///
    /// The frame shares the connection's queue with text frames, so it leaves
    /// in dispatch order. Reads on that connection pause until it is written.
    pub fn dispatch_binary(&self, response: BinaryResponse) -> Delivery {
        let request_id = response.request_id;
        let Some(conn) = self.cache.get(request_id) else {
            return miss(request_id, "binary");
        };

        let len = response.data.len();
        match conn.send_binary(response.data) {
            Ok(()) => {
                debug!(%request_id, conn_id = %conn.id, len, "binary response delivered");
                Delivery::Delivered(conn.id.clone())
            }
            Err(e) => {
                warn!(%request_id, conn_id = %conn.id, len, error = %e, "failed to send binary response");
                Delivery::Failed(conn.id.clone())
            }
        }
    }

    fn broadcast(&self, json: &Arc<String>, kind: &'static str) -> Delivery {
        let mut failed = 0;
        let recipients = self.registry.for_each(|conn| {
            if let Err(e) = conn.send_text(Arc::clone(json)) {
                failed += 1;
                warn!(conn_id = %conn.id, kind, error = %e, "failed to send broadcast to client");
            }
        });
        debug!(kind, recipients, failed, "broadcast response to all");
        Delivery::Broadcast { recipients, failed }
    }

    /// Consume the outbound topic until it closes or `cancel` fires.
    #[instrument(skip_all, name = "dispatcher")]
    pub async fn run(self, mut rx: broadcast::Receiver<Outbound>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    info!("dispatcher cancelled, exiting");
                    break;
                }
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => {
                    let _ = self.dispatch(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "dispatcher lagged, responses skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("outbound topic closed, exiting");
                    break;
                }
            }
        }
    }
}

fn miss(request_id: RequestId, kind: &'static str) -> Delivery {
    counter!("relay_delivery_misses_total").increment(1);
    warn!(%request_id, kind, "no connection for response, dropped");
    Delivery::Missed(request_id)
}
