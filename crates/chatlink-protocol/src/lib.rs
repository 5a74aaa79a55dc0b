//! Chatlink protocol types.
//!
//! Envelopes exchanged over the chat WebSocket, the client-facing error
//! codes with their help hints, the session snapshot produced by token
//! validation, and the negotiated limits/features advertised to clients.
//! This crate is the single source of truth for message type names and
//! error codes.

pub mod auth;
pub mod error;
pub mod limits;
pub mod messages;

pub use auth::{SessionInfo, TokenRefresh, TokenValidation, jwt_expiry, parse_expiry, token_fingerprint};
pub use error::{ErrorCode, ErrorPayload};
pub use limits::{
    CloseCode, ConnectionLimits, ConnectionStats, DiscoveryInfo, FeatureFlags, PROTOCOL_VERSION,
};
pub use messages::{
    ClientMessage, ConnectionEstablished, ForwardedMessage, HeartbeatPayload, MessageTypes,
    PongPayload, ServerMessage, TokenExpiredPayload, TokenRefreshedPayload,
};
