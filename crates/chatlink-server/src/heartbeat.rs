//! Periodic `heartbeat` frames.

use std::sync::Arc;
use std::time::Duration;

use chatlink_protocol::{HeartbeatPayload, ServerMessage};
use chrono::Utc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;

/// Why the heartbeat loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    Cancelled,
    /// The connection left the registry.
    Deregistered,
    /// The outbound channel is closed. The transport itself is left alone;
    /// the receive loop notices the disconnect.
    SendFailed,
}

pub async fn run_heartbeat(
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = time::sleep(interval) => {}
        }

        if !registry.contains(connection.id()) {
            return HeartbeatResult::Deregistered;
        }

        let msg = ServerMessage::Heartbeat(HeartbeatPayload {
            timestamp: Utc::now().to_rfc3339(),
            connection_id: connection.id().to_string(),
        });
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            sent = connection.send(&msg) => sent,
        };
        if let Err(e) = sent {
            debug!("Heartbeat to {} failed: {e}", connection.id());
            return HeartbeatResult::SendFailed;
        }
    }
}
