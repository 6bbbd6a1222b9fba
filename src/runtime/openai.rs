//! OpenAI-compatible chat completion client.
//!
//! Talks to `POST {endpoint}/chat/completions` on the local runtime. The
//! non-streaming call returns every choice; the streaming call decodes the
//! SSE body into [`CompletionUpdate`]s until the `[DONE]` sentinel.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::sse::{SseDecoder, DONE_SENTINEL};
use crate::runtime::{
    error_body, ChatTurn, Completion, CompletionChoice, CompletionClient, CompletionUpdate, Connection,
    RuntimeError, UpdateStream,
};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<Value>,
}

/// Content may be a plain string or an array of `{ "type": "text", "text": ... }` parts.
fn content_fragments(content: Option<Value>) -> Vec<String> {
    match content {
        Some(Value::String(text)) => vec![text],
        Some(Value::Array(parts)) => parts
            .into_iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Chat client bound to one endpoint, credential and model.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, connection: &Connection, model: impl Into<String>) -> Self {
        Self {
            http,
            url: format!("{}/chat/completions", connection.endpoint.trim_end_matches('/')),
            api_key: connection.api_key.clone(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        turns: &[ChatTurn],
        stream: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, RuntimeError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: turns,
            stream,
        };

        let request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            result = request => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            warn!(status = status.as_u16(), url = %self.url, "Completion request rejected");
            return Err(RuntimeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        cancel: &CancellationToken,
    ) -> Result<Completion, RuntimeError> {
        let response = self.send(turns, false, cancel).await?;

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            body = response.bytes() => body?,
        };
        let parsed: ChatCompletionResponse = serde_json::from_slice(&body)?;

        let choices = parsed
            .choices
            .into_iter()
            .map(|choice| CompletionChoice {
                content: content_fragments(choice.message.and_then(|m| m.content)),
            })
            .collect::<Vec<_>>();

        debug!(model = %self.model, choices = choices.len(), "Completion received");
        Ok(Completion { choices })
    }

    async fn complete_streaming(
        &self,
        turns: &[ChatTurn],
        cancel: &CancellationToken,
    ) -> Result<UpdateStream, RuntimeError> {
        let response = self.send(turns, true, cancel).await?;
        Ok(decode_stream(response.bytes_stream().boxed()))
    }
}

struct DecodeState {
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turn a raw SSE byte stream into completion updates, stopping at `[DONE]`.
fn decode_stream(body: BoxStream<'static, reqwest::Result<bytes::Bytes>>) -> UpdateStream {
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.pending.pop_front() {
                if data == DONE_SENTINEL {
                    state.finished = true;
                    state.pending.clear();
                    return None;
                }
                match serde_json::from_str::<ChatCompletionChunk>(&data) {
                    Ok(chunk) => {
                        let content = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta)
                            .map(|d| content_fragments(d.content))
                            .unwrap_or_default();
                        return Some((Ok(CompletionUpdate { content }), state));
                    }
                    Err(e) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(RuntimeError::Decode(e)), state));
                    }
                }
            }

            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => state.pending.extend(state.decoder.push(&bytes)),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(RuntimeError::Http(e)), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.decoder.finish();
                    if !tail.iter().any(|data| data == DONE_SENTINEL) {
                        warn!("Upstream stream ended without {DONE_SENTINEL}; answer may be truncated");
                    }
                    state.pending.extend(tail);
                }
            }
        }
    })
    .boxed()
}
