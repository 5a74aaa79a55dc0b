//! Collaborator error types.

use thiserror::Error;

/// Failure talking to an external service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("unexpected response from {service}: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },

    #[error("{0} is unavailable")]
    Unavailable(String),
}

impl ServiceError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::Database(e) => e.is_closed() || e.as_db_error().is_none(),
            Self::InvalidResponse { .. } => false,
            Self::Unavailable(_) => true,
        }
    }
}

/// Failure reported by the unified message manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The message is well-formed JSON but semantically invalid. Surfaced to
    /// the client as a recoverable error.
    #[error("{message}")]
    Validation {
        code: Option<String>,
        message: String,
    },

    #[error("connection {0} is not registered with the message manager")]
    UnknownConnection(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ManagerError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}
