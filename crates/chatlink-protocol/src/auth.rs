//! Authentication types.
//!
//! [`TokenValidation`] and [`TokenRefresh`] are the response bodies of the
//! external auth service. [`SessionInfo`] is the snapshot kept on each live
//! connection; its token is only ever replaced by the refresh scheduler.
//!
//! Expiries arrive either as ISO-8601 strings or as epoch seconds and are
//! normalized to `DateTime<Utc>`.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ─────────────────────────────────────────────────────────────────────────────
// Auth service responses
// ─────────────────────────────────────────────────────────────────────────────

/// Result of `validate_token`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(default, alias = "sub")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, alias = "token_expires", alias = "exp", with = "expiry")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auth_method: Option<String>,
}

/// Result of `refresh_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefresh {
    #[serde(default = "default_true", alias = "success")]
    pub valid: bool,
    #[serde(default, alias = "access_token")]
    pub new_token: Option<String>,
    #[serde(default, alias = "new_expires", alias = "exp", with = "expiry")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl TokenRefresh {
    /// The refreshed token, if the service actually issued one.
    pub fn issued_token(&self) -> Option<&str> {
        if !self.valid {
            return None;
        }
        self.new_token.as_deref().filter(|t| !t.trim().is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Authentication snapshot for one connection.
#[derive(Debug)]
pub struct SessionInfo {
    pub user_id: String,
    pub email: Option<String>,
    pub permissions: BTreeSet<String>,
    pub authenticated_at: DateTime<Utc>,
    pub current_token: SecretString,
    pub token_expires: Option<DateTime<Utc>>,
    pub auth_method: String,
}

impl SessionInfo {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            permissions: BTreeSet::new(),
            authenticated_at: Utc::now(),
            current_token: SecretString::from(token.into()),
            token_expires: None,
            auth_method: "bearer".into(),
        }
    }

    pub fn with_expiry(mut self, expires: Option<DateTime<Utc>>) -> Self {
        self.token_expires = expires;
        self
    }

    pub fn token(&self) -> &str {
        self.current_token.expose_secret()
    }

    /// Install a refreshed token. A missing expiry keeps the previous one.
    pub fn replace_token(&mut self, token: &str, expires: Option<DateTime<Utc>>) {
        self.current_token = SecretString::from(token.to_owned());
        if expires.is_some() {
            self.token_expires = expires;
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Copy of the snapshot (the secret is re-wrapped, never formatted).
    pub fn snapshot(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            permissions: self.permissions.clone(),
            authenticated_at: self.authenticated_at,
            current_token: SecretString::from(self.token().to_owned()),
            token_expires: self.token_expires,
            auth_method: self.auth_method.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an expiry given as epoch seconds/milliseconds or an ISO-8601 string.
/// Timezone-less ISO strings are taken as UTC.
pub fn parse_expiry(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            from_epoch(secs)
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // Anything past year ~5000 in seconds is a millisecond timestamp.
    if value > 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Read the `exp` claim of a JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp").and_then(parse_expiry)
}

/// Short, log-safe identifier for a token.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(12);
    hex
}

/// Serde adapter for optional expiries.
pub mod expiry {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => super::parse_expiry(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("unrecognized expiry: {value}"))),
        }
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }
}
