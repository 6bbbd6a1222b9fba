//! Chat operations on top of the lazily initialized model client.
//!
//! [`ChatGateway::chat`] returns a whole answer. [`ChatGateway::chat_stream`]
//! spawns a producer task that pulls upstream updates, pushes non-empty text
//! into a bounded channel and sleeps for the configured pacing delay between
//! pushes. The consumer side is a [`ChunkStream`]; dropping it cancels the
//! producer, which drops the upstream stream and its HTTP connection.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::client::LazyModelClient;
use crate::config::{ApiConfig, ModelConfig};
use crate::error::ChatError;
use crate::runtime::{ChatTurn, RuntimeError, UpdateStream};

/// Chunks buffered between producer and consumer.
const STREAM_BUFFER: usize = 16;

/// Per-call knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub initialization_timeout: Duration,
    pub streaming_delay: Option<Duration>,
    pub max_message_length: usize,
}

impl GatewayOptions {
    pub fn from_config(model: &ModelConfig, api: &ApiConfig) -> Self {
        Self {
            initialization_timeout: model.initialization_timeout(),
            streaming_delay: model.streaming_delay(),
            max_message_length: api.max_message_length,
        }
    }
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from_config(&ModelConfig::default(), &ApiConfig::default())
    }
}

pub struct ChatGateway {
    client: Arc<LazyModelClient>,
    options: GatewayOptions,
}

impl ChatGateway {
    pub fn new(client: Arc<LazyModelClient>, options: GatewayOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &Arc<LazyModelClient> {
        &self.client
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Reject messages that are blank or longer than the configured limit.
    pub fn validate(&self, message: &str) -> Result<(), ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::InvalidArgument(
                "Message cannot be empty".to_string(),
            ));
        }
        if message.chars().count() > self.options.max_message_length {
            return Err(ChatError::InvalidArgument(format!(
                "Message must be between 1 and {} characters",
                self.options.max_message_length
            )));
        }
        Ok(())
    }

    /// Send one user turn and return the complete answer.
    pub async fn chat(&self, message: &str) -> Result<String, ChatError> {
        self.chat_with_cancel(message, &CancellationToken::new()).await
    }

    pub async fn chat_with_cancel(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        self.validate(message)?;

        let handle = self
            .client
            .ensure_ready(self.options.initialization_timeout, cancel)
            .await?;

        let turns = [ChatTurn::user(message)];
        let completion = handle
            .client()
            .complete(&turns, cancel)
            .await
            .map_err(upstream_error)?;

        let text = completion
            .first_text()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| upstream_error(RuntimeError::EmptyCompletion))?;

        debug!(model_id = handle.model_id(), chars = text.len(), "Chat completed");
        Ok(text.to_string())
    }

    /// Send one user turn and stream the answer chunk by chunk.
    ///
    /// Validation and initialization errors are returned directly. Once the
    /// stream is open, an upstream failure shows up as a final `Err` item.
    pub async fn chat_stream(
        &self,
        message: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ChatError> {
        self.validate(message)?;

        let handle = self
            .client
            .ensure_ready(self.options.initialization_timeout, &cancel)
            .await?;

        let turns = [ChatTurn::user(message)];
        let updates = handle
            .client()
            .complete_streaming(&turns, &cancel)
            .await
            .map_err(upstream_error)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let producer_cancel = cancel.child_token();
        tokio::spawn(produce_chunks(
            updates,
            tx,
            producer_cancel.clone(),
            self.options.streaming_delay,
        ));

        Ok(ChunkStream {
            inner: ReceiverStream::new(rx),
            cancel: producer_cancel.clone(),
            _guard: producer_cancel.drop_guard(),
        })
    }
}

fn upstream_error(err: RuntimeError) -> ChatError {
    match err {
        RuntimeError::Cancelled => ChatError::Cancelled,
        other => {
            warn!("Upstream completion failed: {other}");
            ChatError::Upstream(other.to_string())
        }
    }
}

/// Pull upstream updates and forward their text until exhaustion, error or cancellation.
async fn produce_chunks(
    mut updates: UpdateStream,
    tx: mpsc::Sender<Result<String, ChatError>>,
    cancel: CancellationToken,
    delay: Option<Duration>,
) {
    let mut chunks = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(chunks, "Stream cancelled");
                return;
            }
            next = updates.next() => next,
        };

        let update = match next {
            Some(Ok(update)) => update,
            Some(Err(RuntimeError::Cancelled)) => return,
            Some(Err(e)) => {
                warn!(chunks, "Stream interrupted: {e}");
                let _ = tx.send(Err(ChatError::Upstream(e.to_string()))).await;
                return;
            }
            None => break,
        };

        let Some(text) = update.first_text() else {
            continue;
        };

        if tx.send(Ok(text.to_string())).await.is_err() {
            // Consumer went away.
            return;
        }
        chunks += 1;

        if let Some(delay) = delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    info!(chunks, "Stream completed");
}

/// Chunks of a streamed answer. Ends with `None` on normal completion, or
/// with one `Err` item when the upstream fails mid-stream.
pub struct ChunkStream {
    inner: ReceiverStream<Result<String, ChatError>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ChunkStream {
    /// Whether the stream was cancelled rather than run to completion.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the producer and end the stream, discarding buffered chunks.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ChunkStream {
    type Item = Result<String, ChatError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
