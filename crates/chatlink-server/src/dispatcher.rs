//! MessageDispatcher: validates inbound frames and routes them.
//!
//! Validation order (first failure wins):
//!
//! | Check                          | Code                   |
//! |--------------------------------|------------------------|
//! | larger than `max_message_size` | `MESSAGE_TOO_LARGE`    |
//! | empty or whitespace            | `EMPTY_MESSAGE`        |
//! | not JSON                       | `JSON_PARSE_ERROR`     |
//! | not an object                  | `INVALID_MESSAGE_TYPE` |
//! | no `type`                      | `MISSING_TYPE_FIELD`   |
//! | `type` not a non-empty string  | `INVALID_TYPE_FIELD`   |
//!
//! `ping`, `pong` and `auth` are answered here. Everything else goes to the
//! unified manager, and `user_message` / `agent_request` to the agent
//! processor after that.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chatlink_protocol::{
    ClientMessage, ErrorCode, ErrorPayload, ForwardedMessage, PongPayload, ServerMessage,
};
use chatlink_services::{AgentProcessor, ManagerError, UnifiedManager};
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::Connection;

/// Run the syntactic checks and classify the message.
pub fn parse_frame(text: &str, max_size: usize) -> Result<ClientMessage, ErrorPayload> {
    if text.len() > max_size {
        return Err(ErrorPayload::message_too_large(text.len(), max_size));
    }
    if text.trim().is_empty() {
        return Err(ErrorPayload::empty_message());
    }

    let value: Value = serde_json::from_str(text).map_err(ErrorPayload::json_parse)?;
    let Value::Object(obj) = &value else {
        return Err(ErrorPayload::invalid_message_type());
    };

    let kind = match obj.get("type") {
        None => return Err(ErrorPayload::missing_type_field()),
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind.clone(),
        Some(_) => return Err(ErrorPayload::invalid_type_field()),
    };

    Ok(ClientMessage::classify(&kind, value))
}

pub struct MessageDispatcher {
    unified: Arc<dyn UnifiedManager>,
    agent: Arc<dyn AgentProcessor>,
    max_message_size: usize,
}

impl MessageDispatcher {
    pub fn new(
        unified: Arc<dyn UnifiedManager>,
        agent: Arc<dyn AgentProcessor>,
        max_message_size: usize,
    ) -> Self {
        Self {
            unified,
            agent,
            max_message_size,
        }
    }

    /// Handle one text frame. On failure the error envelope has already been
    /// sent and the connection's error count bumped; the returned code is for
    /// the caller's consecutive-error accounting.
    pub async fn process_text(&self, conn: &Connection, text: &str) -> Result<(), ErrorCode> {
        match self.dispatch(conn, text).await {
            Ok(()) => Ok(()),
            Err(payload) => Err(self.reject(conn, payload).await),
        }
    }

    /// Binary frames carrying UTF-8 are handled as text.
    pub async fn process_binary(&self, conn: &Connection, bytes: Vec<u8>) -> Result<(), ErrorCode> {
        match String::from_utf8(bytes) {
            Ok(text) => self.process_text(conn, &text).await,
            Err(_) => Err(self.reject(conn, ErrorPayload::invalid_message_type()).await),
        }
    }

    /// Count the failure and tell the client.
    pub async fn reject(&self, conn: &Connection, payload: ErrorPayload) -> ErrorCode {
        conn.record_error();
        let code = payload.error_code();
        debug!("Rejected message on {}: {payload}", conn.id());
        if let Err(e) = conn.send(&ServerMessage::Error(payload)).await {
            debug!("Could not deliver error to {}: {e}", conn.id());
        }
        code
    }

    /// Validate and route without reporting; the error payload is returned.
    pub async fn dispatch(&self, conn: &Connection, text: &str) -> Result<(), ErrorPayload> {
        let msg = parse_frame(text, self.max_message_size)?;

        match msg {
            ClientMessage::Ping { .. } => {
                let now = Utc::now();
                let pong = ServerMessage::Pong(PongPayload {
                    timestamp: now.timestamp_millis(),
                    server_time: now.to_rfc3339(),
                });
                conn.send(&pong).await.map_err(|e| {
                    warn!("Failed to send pong to {}: {e}", conn.id());
                    ErrorPayload::processing_error()
                })
            }
            ClientMessage::Pong => {
                debug!("Pong from {}", conn.id());
                Ok(())
            }
            ClientMessage::Auth => {
                // Authentication happens during the handshake.
                debug!("Ignoring auth message on {}", conn.id());
                Ok(())
            }
            ClientMessage::Forward(msg) => self.forward(conn, &msg).await,
        }
    }

    async fn forward(&self, conn: &Connection, msg: &ForwardedMessage) -> Result<(), ErrorPayload> {
        let handled = AssertUnwindSafe(self.unified.handle_message(conn.id(), conn.user_id(), msg))
            .catch_unwind()
            .await;
        match handled {
            Ok(Ok(())) => {}
            Ok(Err(ManagerError::Validation { code, message })) => {
                return Err(ErrorPayload::validation(code.as_deref(), message));
            }
            Ok(Err(e)) => {
                warn!("Message manager failed on {} ({}): {e}", msg.kind, conn.id());
                return Err(ErrorPayload::processing_error());
            }
            Err(_) => {
                error!("Message manager panicked on {} ({})", msg.kind, conn.id());
                return Err(ErrorPayload::processing_error());
            }
        }

        if msg.is_agent_bound() {
            let processed = AssertUnwindSafe(self.agent.process(conn.id(), conn.user_id(), &msg.raw))
                .catch_unwind()
                .await;
            match processed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Agent processor failed on {} ({}): {e}", msg.kind, conn.id());
                    return Err(ErrorPayload::processing_error());
                }
                Err(_) => {
                    error!("Agent processor panicked on {} ({})", msg.kind, conn.id());
                    return Err(ErrorPayload::processing_error());
                }
            }
        }

        Ok(())
    }
}
