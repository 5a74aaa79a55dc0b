//! Secondary identity check against the user directory, run after the socket
//! is accepted and before the connection is registered.

use std::sync::Arc;
use std::time::Duration;

use chatlink_protocol::CloseCode;
use chatlink_services::{ServiceError, UserDirectory};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Environment;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("user {0} not found")]
    NotFound(String),

    #[error("user {0} is inactive")]
    Inactive(String),

    #[error("user directory unavailable: {0}")]
    Unavailable(#[source] ServiceError),
}

impl IdentityError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::Inactive(_) => CloseCode::POLICY_VIOLATION,
            Self::Unavailable(_) => CloseCode::INTERNAL_ERROR,
        }
    }

    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "User not found",
            Self::Inactive(_) => "User inactive",
            Self::Unavailable(_) => "Identity check failed",
        }
    }
}

pub struct IdentityCheck {
    directory: Arc<dyn UserDirectory>,
    retries: u32,
    backoff: Duration,
    environment: Environment,
}

impl IdentityCheck {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        retries: u32,
        backoff: Duration,
        environment: Environment,
    ) -> Self {
        Self {
            directory,
            retries,
            backoff,
            environment,
        }
    }

    /// Transient directory errors are retried with `backoff × attempt`.
    pub async fn verify(&self, user_id: &str) -> Result<(), IdentityError> {
        let mut attempt = 0;
        let record = loop {
            match self.directory.lookup(user_id).await {
                Ok(record) => break record,
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!("User lookup for {user_id} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(IdentityError::Unavailable(e)),
            }
        };

        match record {
            Some(record) if record.is_active => Ok(()),
            Some(_) => Err(IdentityError::Inactive(user_id.to_string())),
            None if self.environment.tolerates_missing_users() => {
                info!(
                    "User {user_id} has no directory record; allowed in {} environment",
                    self.environment
                );
                Ok(())
            }
            None => Err(IdentityError::NotFound(user_id.to_string())),
        }
    }
}
