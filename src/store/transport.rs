//! Command transport for the shared counter store.
//!
//! The shared store speaks a token-authenticated REST dialect of the Redis
//! command set: a pipeline is a JSON array of commands, each command a JSON
//! array of strings, answered by one `{"result": ...}` or `{"error": ...}`
//! object per command.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

use super::StoreError;

/// One command: the verb followed by its arguments.
pub type Command = Vec<String>;

/// Builds a [`Command`] from displayable parts.
macro_rules! command {
    ($($part:expr),+ $(,)?) => {
        vec![$($part.to_string()),+]
    };
}
pub(crate) use command;

/// Sends a batch of commands in one round trip.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Execute `commands` as one pipelined call and return each command's
    /// result in order. A failure of any single command fails the batch.
    async fn execute(&self, commands: &[Command]) -> Result<Vec<Value>, StoreError>;
}

#[derive(Debug, Deserialize)]
struct PipelineReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP transport posting pipelines to `{url}/pipeline`.
#[derive(Debug, Clone)]
pub struct HttpCommandTransport {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpCommandTransport {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/pipeline", url.trim_end_matches('/')),
            token: token.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CommandTransport for HttpCommandTransport {
    async fn execute(&self, commands: &[Command]) -> Result<Vec<Value>, StoreError> {
        trace!(endpoint = %self.endpoint, commands = commands.len(), "Sending pipeline");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(commands)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!("HTTP {}: {}", status, body)));
        }

        let replies: Vec<PipelineReply> = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        parse_replies(replies, commands.len())
    }
}

fn parse_replies(replies: Vec<PipelineReply>, expected: usize) -> Result<Vec<Value>, StoreError> {
    if replies.len() != expected {
        return Err(StoreError::Protocol(format!(
            "expected {} replies, got {}",
            expected,
            replies.len()
        )));
    }

    replies
        .into_iter()
        .map(|reply| match reply.error {
            Some(err) => Err(StoreError::Backend(err)),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        })
        .collect()
}
