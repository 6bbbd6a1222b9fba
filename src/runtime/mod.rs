//! Upstream collaborators: the local model runtime and its completion API.
//!
//! - [`foundry`]: Foundry Local service discovery and model management
//! - [`openai`]: OpenAI-compatible chat completion client (one-shot and streaming)
//! - [`sse`]: line decoder for the runtime's server-sent-event responses

pub mod foundry;
pub mod openai;
pub mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Runtime returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid runtime response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime command failed: {0}")]
    Command(String),

    #[error("Model runtime service is not available: {0}")]
    ServiceUnavailable(String),

    #[error("Model not found in catalog: {0}")]
    ModelNotFound(String),

    #[error("Completion contained no content")]
    EmptyCompletion,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Initialization task failed: {0}")]
    Task(String),
}

/// Body of a rejected response, or why it could not be read.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => body,
        Err(e) => format!("<unreadable body: {e}>"),
    }
}

/// Metadata the runtime reports for a model alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Concrete model id used in completion requests.
    pub id: String,

    /// Alias the model was resolved from.
    pub alias: String,

    /// Device the variant targets ("GPU", "NPU", "CPU"), when known.
    pub device: Option<String>,
}

/// Where and how to reach the runtime's OpenAI-compatible API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Base URL of the completion API, including the `/v1` suffix.
    pub endpoint: String,

    /// Credential sent as a bearer token.
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the conversation sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One choice of a one-shot completion, with its ordered content fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionChoice {
    pub content: Vec<String>,
}

/// Result of a one-shot completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub choices: Vec<CompletionChoice>,
}

impl Completion {
    /// The first content fragment of the first choice.
    pub fn first_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.content.first())
            .map(String::as_str)
    }
}

/// One incremental update of a streaming completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionUpdate {
    pub content: Vec<String>,
}

impl CompletionUpdate {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text.into()],
        }
    }

    /// The first content fragment, if it carries any text.
    pub fn first_text(&self) -> Option<&str> {
        self.content
            .first()
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }
}

/// Ordered stream of incremental updates. Dropping it releases the upstream connection.
pub type UpdateStream = BoxStream<'static, Result<CompletionUpdate, RuntimeError>>;

/// A client able to run chat completions against a bound model.
///
/// Implementations must tolerate concurrent calls from many requests.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        cancel: &CancellationToken,
    ) -> Result<Completion, RuntimeError>;

    async fn complete_streaming(
        &self,
        turns: &[ChatTurn],
        cancel: &CancellationToken,
    ) -> Result<UpdateStream, RuntimeError>;
}

/// Hosts named models and hands out connection details for them.
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    /// Start the runtime (if needed) and make the model available.
    async fn start_model(&self, alias: &str) -> Result<(), RuntimeError>;

    /// Resolve an alias to concrete model metadata.
    async fn model_info(&self, alias: &str) -> Result<Option<ModelInfo>, RuntimeError>;

    /// Endpoint and credential of the completion API.
    async fn connection(&self) -> Result<Connection, RuntimeError>;

    /// Build a completion client bound to a connection and model.
    fn completion_client(
        &self,
        connection: &Connection,
        model_id: &str,
    ) -> Result<Arc<dyn CompletionClient>, RuntimeError>;

    /// Release whatever the manager holds. Called at most once.
    async fn shutdown(&self, _model_id: Option<&str>) -> Result<(), RuntimeError> {
        Ok(())
    }
}
