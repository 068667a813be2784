//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_core::ConnectionId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// A frame queued for the connection's writer task.
#[derive(Debug)]
pub enum Frame {
    /// Serialized JSON text.
    Text(Arc<String>),
    /// Raw bytes. Reads on the connection stay paused until the writer
    /// drops `pause`, after the write succeeds or fails.
    Binary {
        /// Frame payload.
        data: Bytes,
        /// Held until the frame has left the writer.
        pause: ReceivePause,
    },
}

/// Why a frame could not be handed to a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection is closed or its writer has stopped.
    #[error("connection closed")]
    Closed,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted, not yet registered.
    Connecting = 0,
    /// Registered and exchanging frames.
    Open = 1,
    /// Closed; no further frames are accepted.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Frame>,
    connected_at: Instant,
    /// Whether the client has responded to the last ping.
    is_alive: AtomicBool,
    /// When the last Pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Count of frames that could not be delivered.
    pub dropped_messages: AtomicU64,
    state: AtomicU8,
    /// Number of binary sends in flight. Reads wait while non-zero.
    receive_gate: watch::Sender<usize>,
}

impl ClientConnection {
    /// Create a new connection in the `Connecting` state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        let now = Instant::now();
        let (receive_gate, _) = watch::channel(0);
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            receive_gate,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.tx.is_closed()
    }

    /// Queue a text frame without waiting.
    pub fn send_text(&self, text: Arc<String>) -> Result<(), DeliveryError> {
        if self.state() == ConnectionState::Closed {
            return Err(self.dropped(DeliveryError::Closed));
        }
        self.tx.try_send(Frame::Text(text)).map_err(|e| self.queue_error(&e))
    }

    /// Queue a binary frame without waiting.
    ///
    /// Reads on this connection pause as soon as the frame is queued and
    /// resume once the writer is done with it. A frame that cannot be queued
    /// leaves reads untouched.
    pub fn send_binary(self: &Arc<Self>, data: Bytes) -> Result<(), DeliveryError> {
        if self.state() == ConnectionState::Closed {
            return Err(self.dropped(DeliveryError::Closed));
        }
        let pause = self.pause_receives();
        self.tx
            .try_send(Frame::Binary { data, pause })
            .map_err(|e| self.queue_error(&e))
    }

    /// Pause reads until the returned guard is dropped.
    pub fn pause_receives(self: &Arc<Self>) -> ReceivePause {
        self.receive_gate.send_modify(|n| *n += 1);
        ReceivePause {
            conn: Arc::clone(self),
        }
    }

    fn resume_receives(&self) {
        self.receive_gate.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Whether reads are currently paused.
    pub fn receives_paused(&self) -> bool {
        *self.receive_gate.borrow() > 0
    }

    /// Wait until reads are allowed.
    pub async fn wait_receivable(&self) {
        let mut gate = self.receive_gate.subscribe();
        let _ = gate.wait_for(|paused| *paused == 0).await;
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the connection was established.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    fn queue_error(&self, err: &mpsc::error::TrySendError<Frame>) -> DeliveryError {
        self.dropped(match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn dropped(&self, err: DeliveryError) -> DeliveryError {
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        err
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Keeps reads paused while alive.
#[must_use = "reads resume as soon as the guard is dropped"]
pub struct ReceivePause {
    conn: Arc<ClientConnection>,
}

impl std::fmt::Debug for ReceivePause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePause")
            .field("conn", &self.conn.id)
            .finish()
    }
}

impl Drop for ReceivePause {
    fn drop(&mut self) {
        self.conn.resume_receives();
    }
}
