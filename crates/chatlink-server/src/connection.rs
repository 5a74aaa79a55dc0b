//! Per-connection state and the transport seam.

use std::sync::atomic::{AtomicU64, Ordering};

use chatlink_protocol::{ServerMessage, SessionInfo};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frame queued for the writer task. The writer is the only owner of the
/// socket sink, so these are written in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// Frame read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away without a close handshake.
    #[error("peer disconnected")]
    Disconnected,

    #[error("websocket error: {0}")]
    Socket(String),

    /// The writer task is gone; nothing more can be sent.
    #[error("outbound channel closed")]
    ChannelClosed,

    /// The writer is not draining the outbound queue.
    #[error("outbound queue full")]
    QueueFull,

    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Closing,
    Closed,
}

/// A registered connection.
///
/// Created and owned by the [`ConnectionRegistry`](crate::ConnectionRegistry);
/// background tasks and the receive loop hold `Arc`s to it.
pub struct Connection {
    id: String,
    user_id: String,
    connected_at: DateTime<Utc>,
    session: RwLock<SessionInfo>,
    last_activity: Mutex<DateTime<Utc>>,
    message_count: AtomicU64,
    error_count: AtomicU64,
    status: Mutex<ConnectionStatus>,
    outbound: mpsc::Sender<Outbound>,
    /// Cancels the refresh and heartbeat tasks.
    tasks_cancel: CancellationToken,
    /// Tells the receive loop the server ended the session (eviction, expiry).
    closed: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(id: String, session: SessionInfo, outbound: mpsc::Sender<Outbound>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: session.user_id.clone(),
            connected_at: now,
            session: RwLock::new(session),
            last_activity: Mutex::new(now),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            status: Mutex::new(ConnectionStatus::Connected),
            outbound,
            tasks_cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    // ── Session ─────────────────────────────────────────────────────────

    pub fn session(&self) -> SessionInfo {
        self.session.read().snapshot()
    }

    pub fn current_token(&self) -> String {
        self.session.read().token().to_owned()
    }

    pub fn token_expires(&self) -> Option<DateTime<Utc>> {
        self.session.read().token_expires
    }

    pub(crate) fn install_token(&self, token: &str, expires: Option<DateTime<Utc>>) {
        self.session.write().replace_token(token, expires);
    }

    // ── Counters ────────────────────────────────────────────────────────

    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    pub fn record_message(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Lifetime error total; never reset.
    pub fn record_error(&self) -> u64 {
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    // ── Outbound ────────────────────────────────────────────────────────

    pub async fn send(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let json = msg.to_json().map_err(|source| TransportError::Encode {
            kind: msg.kind(),
            source,
        })?;
        self.outbound
            .send(Outbound::Text(json))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Queue a close frame without waiting for room in the outbound queue.
    pub fn try_close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outbound
            .try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::ChannelClosed,
            })
    }

    // ── Lifecycle signals ───────────────────────────────────────────────

    /// Token handed to background tasks.
    pub fn task_cancellation(&self) -> CancellationToken {
        self.tasks_cancel.clone()
    }

    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Ask the receive loop to end the session.
    pub fn signal_close(&self) {
        self.closed.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancel background tasks and wait for them to finish. Safe to call
    /// more than once; later calls find nothing to await.
    pub async fn shutdown_tasks(&self) {
        self.tasks_cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("Background task of {} panicked: {e}", self.id);
                }
            }
        }
        debug!("Background tasks of {} stopped", self.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("status", &self.status())
            .field("messages", &self.message_count())
            .field("errors", &self.error_count())
            .finish()
    }
}
