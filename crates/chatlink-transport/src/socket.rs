//! Adapts an axum `WebSocket` to the connection manager's seam.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chatlink_protocol::SessionInfo;
use chatlink_server::{ConnectionManager, InboundFrame, Outbound, SessionSummary, TransportError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long the writer may keep flushing after the session ended.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Run one accepted socket until the session ends.
pub async fn serve_socket(
    socket: WebSocket,
    session: SessionInfo,
    manager: Arc<ConnectionManager>,
    outbound_buffer: usize,
) -> SessionSummary {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(outbound_buffer.max(1));
    let mut writer = tokio::spawn(write_outbound(sink, rx));

    let inbound = stream.map(|frame| frame.map(inbound_frame).map_err(read_error));
    let summary = manager.run_connection(session, tx, inbound).await;

    // Every sender is gone once the session is torn down; the writer flushes
    // what is queued, closes the sink and exits.
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("Writer for {:?} did not drain in time", summary.connection_id);
        writer.abort();
    }
    summary
}

/// The only task that writes to the socket.
async fn write_outbound(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!("Socket write failed: {e}");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("Close frame not delivered: {e}");
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

fn inbound_frame(msg: Message) -> InboundFrame {
    match msg {
        Message::Text(text) => InboundFrame::Text(text.as_str().to_owned()),
        Message::Binary(bytes) => InboundFrame::Binary(bytes.to_vec()),
        Message::Ping(_) => InboundFrame::Ping,
        Message::Pong(_) => InboundFrame::Pong,
        Message::Close(_) => InboundFrame::Close,
    }
}

/// Classify a read error from an axum socket. The socket yields nothing
/// useful after a failed read, so every read error ends the session as a
/// disconnect; the cause only matters for the log.
pub fn read_error(err: axum::Error) -> TransportError {
    match io_cause(&err) {
        Some(io) => debug!("Socket reset ({:?}): {err}", io.kind()),
        None => debug!("Socket read failed: {err}"),
    }
    TransportError::Disconnected
}

fn io_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = e.source();
    }
    None
}
