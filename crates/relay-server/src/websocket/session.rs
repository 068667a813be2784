//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{ConnectionId, EventBus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, ConnectionState, Frame};
use super::handler::handle_text;
use super::registry::ConnectionRegistry;
use crate::dispatch::RequestCache;

/// Everything a session needs from the server.
pub struct SessionContext {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Request → connection correlation.
    pub cache: Arc<RequestCache>,
    /// Bus requests are published on.
    pub bus: EventBus,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// How long to wait for a Pong before dropping the client.
    pub heartbeat_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Longest a single socket write may take before the session is closed.
    pub write_timeout: Duration,
    /// Server shutdown; ends every session when cancelled.
    pub shutdown: CancellationToken,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection so it receives broadcasts
/// 2. Spawns the writer (queued frames plus periodic Ping)
/// 3. Handles frames only while the receive gate is open; text frames become
///    correlated requests, binary frames are ignored
/// 4. On close, stream end or heartbeat timeout, marks the connection
///    closed and unregisters it
#[instrument(skip_all, fields(conn_id = %id))]
pub async fn run_session<S, R>(id: ConnectionId, ws_tx: S, mut ws_rx: R, ctx: Arc<SessionContext>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (send_tx, send_rx) = mpsc::channel(ctx.send_queue_capacity.max(1));
    let conn = Arc::new(ClientConnection::new(id, send_tx));
    let closing = ctx.shutdown.child_token();

    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    ctx.registry.add(Arc::clone(&conn));
    conn.set_state(ConnectionState::Open);

    let mut writer = tokio::spawn(write_frames(
        ws_tx,
        send_rx,
        Arc::clone(&conn),
        WriterTimings {
            heartbeat_interval: ctx.heartbeat_interval,
            heartbeat_timeout: ctx.heartbeat_timeout,
            write_timeout: ctx.write_timeout,
        },
        closing.clone(),
    ));

    loop {
        let msg = tokio::select! {
            () = closing.cancelled() => {
                debug!("writer stopped or server shutting down, ending session");
                break;
            }
            msg = ws_rx.next() => msg,
        };

        let Some(msg) = msg else {
            info!("client stream ended");
            break;
        };

        // A frame read during a binary send is held until the send completes.
        tokio::select! {
            () = closing.cancelled() => break,
            () = conn.wait_receivable() => {}
        }

        match msg {
            Ok(Message::Text(text)) => {
                let _ = handle_text(text.as_str(), &conn, &ctx.cache, &ctx.bus);
            }
            Ok(Message::Binary(data)) => {
                info!(len = data.len(), "ignoring binary frame from client");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => conn.mark_alive(),
            Ok(Message::Close(_)) => {
                info!("client sent close frame");
                break;
            }
            Err(e) => {
                warn!(error = %e, "websocket read error");
            }
        }
    }

    conn.set_state(ConnectionState::Closed);
    let _ = ctx.registry.remove(&conn.id);
    closing.cancel();
    // Let the writer flush what is already queued, then stop it regardless.
    if tokio::time::timeout(ctx.write_timeout, &mut writer).await.is_err() {
        warn!("writer did not finish flushing, aborting");
        writer.abort();
    }

    info!(dropped = conn.drop_count(), "client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(conn.age().as_secs_f64());
}

/// Timers driving the writer task.
#[derive(Debug, Clone, Copy)]
struct WriterTimings {
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    write_timeout: Duration,
}

/// Forward queued frames to the socket and keep the heartbeat going.
///
/// On shutdown, frames already queued are flushed before the socket is
/// closed. Cancels `closing` on exit so the reader stops too.
async fn write_frames<S>(
    mut ws_tx: S,
    mut frames: mpsc::Receiver<Frame>,
    conn: Arc<ClientConnection>,
    timings: WriterTimings,
    closing: CancellationToken,
) where
    S: Sink<Message> + Unpin,
{
    let mut ping_interval = tokio::time::interval(timings.heartbeat_interval);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if !write_frame(&mut ws_tx, frame, timings.write_timeout).await {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if !conn.check_alive() && conn.last_pong_elapsed() > timings.heartbeat_timeout {
                    warn!(timeout = ?timings.heartbeat_timeout, "client unresponsive, disconnecting");
                    break;
                }
                if !write_message(&mut ws_tx, Message::Ping(Bytes::new()), timings.write_timeout).await {
                    break;
                }
            }
            () = closing.cancelled() => {
                while let Ok(frame) = frames.try_recv() {
                    if !write_frame(&mut ws_tx, frame, timings.write_timeout).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = tokio::time::timeout(timings.write_timeout, ws_tx.close()).await;
    closing.cancel();
}

/// Write one queued frame. A binary frame's receive pause ends here, whether
/// the write succeeded or not.
async fn write_frame<S>(ws_tx: &mut S, frame: Frame, write_timeout: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    match frame {
        Frame::Text(text) => {
            write_message(ws_tx, Message::Text(text.as_str().to_owned().into()), write_timeout).await
        }
        Frame::Binary { data, pause } => {
            let written = write_message(ws_tx, Message::Binary(data), write_timeout).await;
            drop(pause);
            written
        }
    }
}

async fn write_message<S>(ws_tx: &mut S, msg: Message, write_timeout: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    match tokio::time::timeout(write_timeout, ws_tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            debug!("socket write failed");
            false
        }
        Err(_) => {
            warn!(timeout = ?write_timeout, "socket write timed out, disconnecting");
            counter!("ws_write_timeouts_total").increment(1);
            false
        }
    }
}
