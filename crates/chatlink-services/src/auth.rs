//! Auth service client.
//!
//! The connection manager never issues tokens. It asks the platform's auth
//! service whether a bearer token is valid and, later, for a fresh token
//! shortly before the current one expires.

use std::time::Duration;

use async_trait::async_trait;
use chatlink_protocol::{TokenRefresh, TokenValidation};
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::error::ServiceError;

/// External auth service.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Validate a bearer token. An invalid token is `Ok` with `valid: false`;
    /// `Err` means the service itself could not answer.
    async fn validate_token(&self, token: &str) -> Result<TokenValidation, ServiceError>;

    /// Exchange the current token for a fresh one.
    async fn refresh_token(&self, token: &str) -> Result<TokenRefresh, ServiceError>;
}

/// Auth service reached over HTTP.
///
/// - `POST {base}/validate` with `Authorization: Bearer <token>`
/// - `POST {base}/refresh` with body `{"token": "<token>"}`
///
/// 401/403 answers are treated as "token not valid", not as failures.
pub struct HttpAuthService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

fn is_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn validate_token(&self, token: &str) -> Result<TokenValidation, ServiceError> {
        let resp = self
            .client
            .post(self.url("validate"))
            .bearer_auth(token)
            .send()
            .await?;

        if is_rejection(resp.status()) {
            debug!("Auth service rejected token ({})", resp.status());
            return Ok(TokenValidation::default());
        }

        let body = resp.error_for_status()?.json::<TokenValidation>().await?;
        Ok(body)
    }

    async fn refresh_token(&self, token: &str) -> Result<TokenRefresh, ServiceError> {
        let resp = self
            .client
            .post(self.url("refresh"))
            .json(&json!({ "token": token }))
            .send()
            .await?;

        if is_rejection(resp.status()) {
            debug!("Auth service refused refresh ({})", resp.status());
            return Ok(TokenRefresh {
                valid: false,
                new_token: None,
                expires_at: None,
            });
        }

        let body = resp.error_for_status()?.json::<TokenRefresh>().await?;
        if body.valid && body.new_token.is_none() {
            return Err(ServiceError::InvalidResponse {
                service: "auth",
                message: "refresh succeeded without a new token".into(),
            });
        }
        Ok(body)
    }
}
