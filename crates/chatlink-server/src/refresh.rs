//! Token refresh scheduler.
//!
//! One loop per connection: sleep until `refresh_buffer` before the token
//! expires, ask the auth service for a new token, push it to the client and
//! go around again. Any refresh failure ends the session: the client gets a
//! `token_expired` notice, a short grace period, then a policy-violation close.

use std::sync::Arc;
use std::time::Duration;

use chatlink_protocol::{
    CloseCode, ServerMessage, TokenExpiredPayload, TokenRefreshedPayload, jwt_expiry,
    token_fingerprint,
};
use chatlink_services::AuthService;
use chrono::{TimeDelta, Utc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionStatus};
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Cancelled,
    /// The connection left the registry while the loop slept.
    Deregistered,
    /// Refresh failed; the client was told and the socket closed.
    Expired,
    /// The current token carries no expiry, nothing to schedule.
    NoExpiry,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub buffer: Duration,
    pub grace: Duration,
    pub call_timeout: Duration,
}

pub async fn run_token_refresh(
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    auth: Arc<dyn AuthService>,
    settings: RefreshSettings,
    cancel: CancellationToken,
) -> RefreshOutcome {
    let buffer = TimeDelta::from_std(settings.buffer).unwrap_or(TimeDelta::MAX);

    loop {
        let Some(expires) = connection.token_expires() else {
            debug!("Token of {} has no expiry, refresh not scheduled", connection.id());
            return RefreshOutcome::NoExpiry;
        };

        let wait = expires - Utc::now() - buffer;
        if wait <= TimeDelta::zero() {
            info!("Token of {} is within the refresh window, expiring", connection.id());
            return expire(&connection, settings.grace, &cancel).await;
        }
        let wait = wait.to_std().unwrap_or_default();
        debug!("Refreshing token of {} in {wait:?}", connection.id());

        tokio::select! {
            biased;
            () = cancel.cancelled() => return RefreshOutcome::Cancelled,
            () = time::sleep(wait) => {}
        }

        if !registry.contains(connection.id()) {
            return RefreshOutcome::Deregistered;
        }

        let token = connection.current_token();
        let fingerprint = token_fingerprint(&token);
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return RefreshOutcome::Cancelled,
            r = time::timeout(settings.call_timeout, auth.refresh_token(&token)) => r,
        };

        let refresh = match result {
            Ok(Ok(refresh)) => refresh,
            Ok(Err(e)) => {
                warn!("Token refresh for {} failed (token {fingerprint}): {e}", connection.id());
                return expire(&connection, settings.grace, &cancel).await;
            }
            Err(_) => {
                warn!(
                    "Token refresh for {} timed out after {:?}",
                    connection.id(),
                    settings.call_timeout
                );
                return expire(&connection, settings.grace, &cancel).await;
            }
        };

        let Some(new_token) = refresh.issued_token() else {
            warn!("Auth service refused refresh of {} (token {fingerprint})", connection.id());
            return expire(&connection, settings.grace, &cancel).await;
        };

        let new_expiry = refresh.expires_at.or_else(|| jwt_expiry(new_token));
        connection.install_token(new_token, new_expiry);
        info!(
            "Refreshed token of {} ({fingerprint} -> {})",
            connection.id(),
            token_fingerprint(new_token)
        );

        let now = Utc::now();
        let notice = ServerMessage::TokenRefreshed(TokenRefreshedPayload {
            new_token: new_token.to_string(),
            expires_at: new_expiry.map(|e| e.to_rfc3339()),
            connection_id: connection.id().to_string(),
            refreshed_at: now.to_rfc3339(),
        });
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return RefreshOutcome::Cancelled,
            sent = connection.send(&notice) => sent,
        };
        if let Err(e) = sent {
            debug!("Could not deliver refreshed token to {}: {e}", connection.id());
        }

        if new_expiry.is_none() {
            debug!("Refreshed token of {} has no expiry, stopping", connection.id());
            return RefreshOutcome::NoExpiry;
        }
    }
}

/// Notify, wait the grace period, close with 1008 and stop the receive loop.
async fn expire(
    connection: &Connection,
    grace: Duration,
    cancel: &CancellationToken,
) -> RefreshOutcome {
    let notice = ServerMessage::TokenExpired(TokenExpiredPayload {
        message: "Your session token has expired. Please re-authenticate.".into(),
        connection_id: connection.id().to_string(),
        action_required: "reauthenticate".into(),
        expired_at: Utc::now().to_rfc3339(),
    });
    let sent = tokio::select! {
        biased;
        () = cancel.cancelled() => return RefreshOutcome::Cancelled,
        sent = connection.send(&notice) => sent,
    };
    if let Err(e) = sent {
        debug!("Could not deliver token_expired to {}: {e}", connection.id());
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => return RefreshOutcome::Cancelled,
        () = time::sleep(grace) => {}
    }

    connection.set_status(ConnectionStatus::Closing);
    let closed = tokio::select! {
        biased;
        () = cancel.cancelled() => return RefreshOutcome::Cancelled,
        closed = connection.close(CloseCode::POLICY_VIOLATION, "Token expired") => closed,
    };
    if let Err(e) = closed {
        debug!("Close after expiry of {} failed: {e}", connection.id());
    }
    connection.signal_close();
    RefreshOutcome::Expired
}
