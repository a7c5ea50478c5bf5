//! HTTP agent connector.
//!
//! Stage executor: POST the stage context as JSON, interpret the JSON reply.
//! Message forwarder: POST inter-agent messages to the agent's endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::AgentMessage;
use crate::engine::{MessageHandler, StageContext, StageExecutor, StageOutcome};

/// Stage executor backed by an HTTP endpoint
pub struct HttpExecutor {
    agent: String,
    url: String,
    token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(agent: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent.into(),
            url: url.into(),
            token: None,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl StageExecutor for HttpExecutor {
    fn name(&self) -> &str {
        &self.agent
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(ctx);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach agent '{}' at {}", self.agent, self.url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent '{}' error ({}): {}", self.agent, status, text.trim());
        }

        let body = response
            .json()
            .await
            .with_context(|| format!("Agent '{}' returned invalid JSON", self.agent))?;
        debug!(agent = %self.agent, stage = %ctx.stage_id, %status, "Agent responded");

        Ok(StageOutcome::from_response(body))
    }
}

/// Bus handler that forwards messages to `url` in the background.
///
/// Delivery means the message was handed to the forwarder; a failing POST
/// is logged. Needs a tokio runtime at send time.
pub fn message_forwarder(url: String, timeout: Duration) -> MessageHandler {
    let client = reqwest::Client::new();

    std::sync::Arc::new(move |message: &AgentMessage| -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("Message forwarding requires a tokio runtime")?;

        let request = client.post(&url).timeout(timeout).json(message);
        let id = message.id;
        let to = message.to.clone();
        handle.spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => debug!(%id, %to, "Message forwarded"),
                Err(e) => warn!(%id, %to, error = %e, "Message forwarding failed"),
            }
        });
        Ok(())
    })
}
