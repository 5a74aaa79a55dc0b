//! Negotiated limits, feature flags, close codes and live statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Protocol version reported by the discovery endpoint.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Per-connection limits advertised to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLimits {
    /// Live connections allowed per user before the oldest is evicted (default: 5)
    pub max_connections_per_user: usize,
    /// Advisory message rate (default: 60)
    pub max_messages_per_minute: u32,
    /// Maximum inbound frame size in bytes (default: 10 KB)
    pub max_message_size: usize,
    /// Heartbeat interval in seconds (default: 30)
    pub heartbeat_interval: u64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            max_messages_per_minute: 60,
            max_message_size: 10 * 1024,
            heartbeat_interval: 30,
        }
    }
}

/// Capabilities advertised in the welcome message and discovery response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub json_first: bool,
    pub auth_required: bool,
    pub heartbeat_supported: bool,
    pub reconnection_supported: bool,
    pub rate_limiting: bool,
    pub message_queuing: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            json_first: true,
            auth_required: true,
            heartbeat_supported: true,
            reconnection_supported: true,
            rate_limiting: true,
            message_queuing: true,
        }
    }
}

/// Registry snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub active_users: usize,
    pub connections_per_user: BTreeMap<String, usize>,
}

/// Response body of the discovery endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub protocol_version: String,
    pub features: FeatureFlags,
    pub limits: ConnectionLimits,
    pub stats: ConnectionStats,
    pub instance_id: String,
}

/// WebSocket close codes used by the server.
pub struct CloseCode;

impl CloseCode {
    /// Eviction for the per-user connection cap
    pub const NORMAL: u16 = 1000;
    /// Token expiry, error limit, rejected identity
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Identity check could not be completed
    pub const INTERNAL_ERROR: u16 = 1011;
}
