//! TokenValidator: checks a bearer token before the socket is accepted.

use std::sync::Arc;
use std::time::Duration;

use chatlink_protocol::{SessionInfo, jwt_expiry, token_fingerprint};
use chatlink_services::{AuthService, ServiceError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    /// The client is at fault; the upgrade is refused with 401.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("auth service error: {0}")]
    Service(#[from] ServiceError),

    #[error("auth service did not answer within {0:?}")]
    Timeout(Duration),
}

impl AuthError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

pub struct TokenValidator {
    auth: Arc<dyn AuthService>,
    call_timeout: Duration,
}

impl TokenValidator {
    pub fn new(auth: Arc<dyn AuthService>, call_timeout: Duration) -> Self {
        Self { auth, call_timeout }
    }

    /// Validate a token and build the session snapshot. No retries.
    pub async fn validate(&self, token: Option<&str>) -> Result<SessionInfo, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthorized("no token provided"))?;
        let fingerprint = token_fingerprint(token);

        let validation = tokio::time::timeout(self.call_timeout, self.auth.validate_token(token))
            .await
            .map_err(|_| {
                warn!("Token validation timed out (token {fingerprint})");
                AuthError::Timeout(self.call_timeout)
            })?
            .inspect_err(|e| warn!("Token validation failed (token {fingerprint}): {e}"))?;

        if !validation.valid {
            debug!("Rejected token {fingerprint}");
            return Err(AuthError::Unauthorized("invalid or expired token"));
        }

        let user_id = validation
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(AuthError::Unauthorized("invalid user information"))?
            .to_string();

        let expires = validation.expires_at.or_else(|| jwt_expiry(token));
        let mut session = SessionInfo::new(user_id, token).with_expiry(expires);
        session.email = validation.email;
        session.permissions = validation.permissions.into_iter().collect();
        if let Some(method) = validation.auth_method {
            session.auth_method = method;
        }

        debug!(
            "Token {fingerprint} valid for {} (expires: {})",
            session.user_id,
            expires.map_or_else(|| "never".to_string(), |e| e.to_rfc3339())
        );
        Ok(session)
    }
}
