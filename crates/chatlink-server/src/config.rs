//! Connection manager configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chatlink_protocol::{ConnectionLimits, FeatureFlags};
use thiserror::Error;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    /// Whether an authenticated user with no directory record may connect
    /// anyway. Nothing is provisioned; the connection simply proceeds.
    pub fn tolerates_missing_users(self) -> bool {
        matches!(self, Self::Development | Self::Test)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown environment '{0}' (expected development, test, staging or production)")]
pub struct UnknownEnvironment(String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" | "testing" => Ok(Self::Test),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(UnknownEnvironment(other.to_string())),
        }
    }
}

/// Runtime settings of the [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Limits advertised to clients; `max_connections_per_user`,
    /// `max_message_size` and `heartbeat_interval` are enforced.
    pub limits: ConnectionLimits,
    pub features: FeatureFlags,
    /// Silence on the socket before a MESSAGE_TIMEOUT notice (default: 60s)
    pub receive_timeout: Duration,
    /// Refresh this long before the token expires (default: 300s)
    pub refresh_buffer: Duration,
    /// Delay between `token_expired` and the forced close (default: 2s)
    pub expiry_grace: Duration,
    /// Bound on each validate/refresh call (default: 5s)
    pub auth_call_timeout: Duration,
    /// Consecutive failures that end the session (default: 5)
    pub max_consecutive_errors: u32,
    /// Pause after an unexpected transport error (default: 100ms)
    pub error_pause: Duration,
    /// Retries of the user directory lookup on transient failures (default: 2)
    pub identity_retries: u32,
    /// Backoff unit between lookup retries, multiplied by the attempt number
    pub identity_backoff: Duration,
    pub environment: Environment,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            limits: ConnectionLimits::default(),
            features: FeatureFlags::default(),
            receive_timeout: Duration::from_secs(60),
            refresh_buffer: Duration::from_secs(300),
            expiry_grace: Duration::from_secs(2),
            auth_call_timeout: Duration::from_secs(5),
            max_consecutive_errors: 5,
            error_pause: Duration::from_millis(100),
            identity_retries: 2,
            identity_backoff: Duration::from_millis(100),
            environment: Environment::default(),
        }
    }
}

impl ManagerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.limits.heartbeat_interval.max(1))
    }
}
