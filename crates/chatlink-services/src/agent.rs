//! Agent processor: hands `user_message` / `agent_request` messages to the
//! agent execution pipeline. How responses are produced is not our concern;
//! the pipeline replies to clients on its own channels.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::error::ServiceError;

#[async_trait]
pub trait AgentProcessor: Send + Sync {
    async fn process(
        &self,
        connection_id: &str,
        user_id: &str,
        message: &Value,
    ) -> Result<(), ServiceError>;
}

/// Posts each message to the agent pipeline's HTTP intake.
pub struct HttpAgentProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgentProcessor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl AgentProcessor for HttpAgentProcessor {
    async fn process(
        &self,
        connection_id: &str,
        user_id: &str,
        message: &Value,
    ) -> Result<(), ServiceError> {
        self.client
            .post(&self.endpoint)
            .json(&json!({
                "connection_id": connection_id,
                "user_id": user_id,
                "message": message,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no agent pipeline is configured.
#[derive(Debug, Default)]
pub struct LoggingAgentProcessor;

#[async_trait]
impl AgentProcessor for LoggingAgentProcessor {
    async fn process(
        &self,
        connection_id: &str,
        user_id: &str,
        message: &Value,
    ) -> Result<(), ServiceError> {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("?");
        info!("Agent pipeline not configured; dropping {kind} from {user_id} ({connection_id})");
        Ok(())
    }
}
