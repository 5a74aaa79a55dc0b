//! Unified message manager.
//!
//! Receives every non-system message after the connection manager has checked
//! its shape. It owns semantic validation (what a given message type must
//! carry) and the business dispatch of the message.

use std::time::Instant;

use async_trait::async_trait;
use chatlink_protocol::{ForwardedMessage, MessageTypes};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ManagerError;

#[async_trait]
pub trait UnifiedManager: Send + Sync {
    async fn connect(&self, connection_id: &str, user_id: &str) -> Result<(), ManagerError>;

    async fn disconnect(&self, connection_id: &str) -> Result<(), ManagerError>;

    /// Validate and dispatch a forwarded message. `ManagerError::Validation`
    /// is reported to the client; other errors become a generic processing
    /// error.
    async fn handle_message(
        &self,
        connection_id: &str,
        user_id: &str,
        message: &ForwardedMessage,
    ) -> Result<(), ManagerError>;
}

struct LocalConnection {
    user_id: String,
    connected_at: Instant,
    messages: u64,
}

/// In-process manager: tracks connected ids and applies the payload rules
/// shared by all message types.
#[derive(Default)]
pub struct LocalUnifiedManager {
    connections: DashMap<String, LocalConnection>,
}

impl LocalUnifiedManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn messages_handled(&self, connection_id: &str) -> Option<u64> {
        self.connections.get(connection_id).map(|c| c.messages)
    }

    fn validate(message: &ForwardedMessage) -> Result<(), ManagerError> {
        match &message.payload {
            None | Some(Value::Object(_)) => {}
            Some(_) => {
                return Err(ManagerError::validation(
                    "INVALID_PAYLOAD",
                    "Message 'payload' must be a JSON object",
                ));
            }
        }

        if message.kind == MessageTypes::USER_MESSAGE {
            let content = message
                .payload
                .as_ref()
                .and_then(|p| p.get("content"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if content.is_empty() {
                return Err(ManagerError::validation(
                    "MISSING_CONTENT",
                    "user_message requires a non-empty 'payload.content' string",
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl UnifiedManager for LocalUnifiedManager {
    async fn connect(&self, connection_id: &str, user_id: &str) -> Result<(), ManagerError> {
        self.connections.insert(
            connection_id.to_string(),
            LocalConnection {
                user_id: user_id.to_string(),
                connected_at: Instant::now(),
                messages: 0,
            },
        );
        debug!("Message manager: {connection_id} connected");
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ManagerError> {
        if let Some((_, conn)) = self.connections.remove(connection_id) {
            info!(
                "Message manager: {connection_id} ({}) disconnected after {:?}, {} messages",
                conn.user_id,
                conn.connected_at.elapsed(),
                conn.messages
            );
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        connection_id: &str,
        user_id: &str,
        message: &ForwardedMessage,
    ) -> Result<(), ManagerError> {
        Self::validate(message)?;

        let mut conn = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| ManagerError::UnknownConnection(connection_id.to_string()))?;
        conn.messages += 1;

        debug!("Message manager: {} from {user_id} on {connection_id}", message.kind);
        Ok(())
    }
}
