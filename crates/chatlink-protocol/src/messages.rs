//! Message envelopes.
//!
//! Every frame is a JSON object with a `type` discriminator and an optional
//! `payload` object:
//!
//! ```text
//! client → server   { "type": "ping", "payload": { ... } }
//! server → client   { "type": "pong", "payload": { "timestamp": ..., "server_time": ... } }
//! ```
//!
//! Only the system kinds (`ping`, `pong`, `auth`) are interpreted here.
//! Everything else travels as an opaque [`ForwardedMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;
use crate::limits::{ConnectionLimits, FeatureFlags};

/// Message type names.
pub struct MessageTypes;

impl MessageTypes {
    // ── System (handled by the connection manager) ──────────────────────
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const AUTH: &str = "auth";

    // ── Forwarded to the agent pipeline as well ─────────────────────────
    pub const USER_MESSAGE: &str = "user_message";
    pub const AGENT_REQUEST: &str = "agent_request";

    // ── Server → client ─────────────────────────────────────────────────
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const TOKEN_REFRESHED: &str = "token_refreshed";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const ERROR: &str = "error";
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Welcome message sent once the connection is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub user_id: String,
    pub connection_id: String,
    pub server_time: String,
    pub features: FeatureFlags,
    pub limits: ConnectionLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Server clock in epoch milliseconds
    pub timestamp: i64,
    pub server_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRefreshedPayload {
    pub new_token: String,
    pub expires_at: Option<String>,
    pub connection_id: String,
    pub refreshed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenExpiredPayload {
    pub message: String,
    pub connection_id: String,
    pub action_required: String,
    pub expired_at: String,
}

/// Outbound envelope, serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished(ConnectionEstablished),
    Pong(PongPayload),
    Heartbeat(HeartbeatPayload),
    TokenRefreshed(TokenRefreshedPayload),
    TokenExpired(TokenExpiredPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => MessageTypes::CONNECTION_ESTABLISHED,
            Self::Pong(_) => MessageTypes::PONG,
            Self::Heartbeat(_) => MessageTypes::HEARTBEAT,
            Self::TokenRefreshed(_) => MessageTypes::TOKEN_REFRESHED,
            Self::TokenExpired(_) => MessageTypes::TOKEN_EXPIRED,
            Self::Error(_) => MessageTypes::ERROR,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ErrorPayload> for ServerMessage {
    fn from(err: ErrorPayload) -> Self {
        Self::Error(err)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// A message this subsystem does not interpret. `raw` is the full object as
/// received, handed unchanged to downstream collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedMessage {
    pub kind: String,
    pub payload: Option<Value>,
    pub raw: Value,
}

impl ForwardedMessage {
    /// `user_message` and `agent_request` also go to the agent pipeline.
    pub fn is_agent_bound(&self) -> bool {
        self.kind == MessageTypes::USER_MESSAGE || self.kind == MessageTypes::AGENT_REQUEST
    }
}

/// Inbound message after syntactic validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping { payload: Option<Value> },
    Pong,
    Auth,
    Forward(ForwardedMessage),
}

impl ClientMessage {
    /// Classify an object whose `type` field has already been validated.
    pub fn classify(kind: &str, raw: Value) -> Self {
        let payload = raw.get("payload").cloned();
        match kind {
            MessageTypes::PING => Self::Ping { payload },
            MessageTypes::PONG => Self::Pong,
            MessageTypes::AUTH => Self::Auth,
            _ => Self::Forward(ForwardedMessage {
                kind: kind.to_string(),
                payload,
                raw,
            }),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Ping { .. } => MessageTypes::PING,
            Self::Pong => MessageTypes::PONG,
            Self::Auth => MessageTypes::AUTH,
            Self::Forward(msg) => &msg.kind,
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, Self::Forward(_))
    }
}
