//! SSE (Server-Sent Events) framing for streamed chat answers.
//!
//! Every chunk becomes one event with `{"chunk": "..."}` as data. A normal end
//! is marked with `{"done": true}`; a failure with `{"error": "..."}`, after
//! which the stream closes. A cancelled stream just stops.

use std::convert::Infallible;

use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;

use crate::error::ChatError;
use crate::gateway::ChunkStream;

/// Generic message shown when detailed errors are off.
pub const STREAM_ERROR_MESSAGE: &str = "An error occurred while streaming the response";

/// Data payload of one SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Chunk { chunk: String },
    Done { done: bool },
    Error { error: String },
}

impl StreamEvent {
    pub fn error(err: &ChatError, detailed: bool) -> Self {
        StreamEvent::Error {
            error: if detailed {
                err.to_string()
            } else {
                STREAM_ERROR_MESSAGE.to_string()
            },
        }
    }

    pub fn into_sse(self) -> Event {
        let data = serde_json::to_string(&self).unwrap_or_default();
        Event::default().data(data)
    }
}

/// Frame a chunk stream as events, appending the terminal `done` or `error` event.
pub fn chunk_events(chunks: ChunkStream, detailed: bool) -> impl Stream<Item = StreamEvent> + Send {
    stream::unfold(Some(chunks), move |state| async move {
        let mut chunks = state?;
        match chunks.next().await {
            Some(Ok(chunk)) => Some((StreamEvent::Chunk { chunk }, Some(chunks))),
            Some(Err(err)) => Some((StreamEvent::error(&err, detailed), None)),
            None if chunks.is_cancelled() => None,
            None => Some((StreamEvent::Done { done: true }, None)),
        }
    })
}

/// A stream consisting of a single error event.
pub fn error_events(err: &ChatError, detailed: bool) -> impl Stream<Item = StreamEvent> + Send {
    stream::once(futures::future::ready(StreamEvent::error(err, detailed)))
}

/// Wrap events into an SSE response with caching disabled and a persistent connection.
pub fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let stream = events.map(|event| Ok::<_, Infallible>(event.into_sse()));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}
