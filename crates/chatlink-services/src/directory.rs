//! User directory: confirms that an authenticated user still exists and is
//! active before a connection is registered.

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{error, info};

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub is_active: bool,
}

impl UserRecord {
    pub fn active(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_active: true,
        }
    }
}

/// Persistence-layer lookup of users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Ok(None)` when the user does not exist.
    async fn lookup(&self, user_id: &str) -> Result<Option<UserRecord>, ServiceError>;
}

/// Directory backed by the platform's Postgres `users` table.
pub struct PostgresUserDirectory {
    client: tokio_postgres::Client,
}

impl PostgresUserDirectory {
    pub async fn connect(database_url: &str) -> Result<Self, ServiceError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        // TODO: reconnect when the connection task ends instead of failing every lookup.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("User directory connection closed: {e}");
            }
        });

        info!("User directory connected");
        Ok(Self { client })
    }
}

#[async_trait]
impl UserDirectory for PostgresUserDirectory {
    async fn lookup(&self, user_id: &str) -> Result<Option<UserRecord>, ServiceError> {
        if self.client.is_closed() {
            return Err(ServiceError::Unavailable("user directory".into()));
        }

        let row = self
            .client
            .query_opt(
                "SELECT id::text AS id, is_active FROM users WHERE id::text = $1",
                &[&user_id],
            )
            .await?;

        Ok(row.map(|row| UserRecord {
            user_id: row.get("id"),
            is_active: row.get("is_active"),
        }))
    }
}

/// Directory used when no database is configured: every authenticated user
/// is considered active.
#[derive(Debug, Default)]
pub struct AcceptAllDirectory;

#[async_trait]
impl UserDirectory for AcceptAllDirectory {
    async fn lookup(&self, user_id: &str) -> Result<Option<UserRecord>, ServiceError> {
        Ok(Some(UserRecord::active(user_id)))
    }
}
