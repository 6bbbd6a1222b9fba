//! Scripted runtime used by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use foundry_chat::runtime::{
    ChatTurn, Completion, CompletionChoice, CompletionClient, CompletionUpdate, Connection,
    ModelInfo, RuntimeError, RuntimeManager, UpdateStream,
};

pub const SKY_CHUNKS: [&str; 4] = ["Because ", "of ", "Rayleigh ", "scattering."];

/// Counts live upstream streams so tests can check they are released.
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct StubClient {
    pub chunks: Vec<String>,
    /// Fail the stream with an HTTP-like error after this many updates.
    pub fail_after: Option<usize>,
    /// Make the one-shot call fail.
    pub fail_complete: bool,
    pub open_streams: Arc<AtomicUsize>,
    pub prompts: Mutex<Vec<String>>,
}

impl StubClient {
    pub fn with_chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn record(&self, turns: &[ChatTurn]) {
        let mut prompts = self.prompts.lock().unwrap();
        prompts.extend(turns.iter().map(|t| t.content.clone()));
    }
}

#[async_trait]
impl CompletionClient for StubClient {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        _cancel: &CancellationToken,
    ) -> Result<Completion, RuntimeError> {
        self.record(turns);
        if self.fail_complete {
            return Err(RuntimeError::Status {
                status: 503,
                body: "model busy".to_string(),
            });
        }
        Ok(Completion {
            choices: vec![CompletionChoice {
                content: vec![self.chunks.concat()],
            }],
        })
    }

    async fn complete_streaming(
        &self,
        turns: &[ChatTurn],
        _cancel: &CancellationToken,
    ) -> Result<UpdateStream, RuntimeError> {
        self.record(turns);
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(self.open_streams.clone());

        let mut items: Vec<Result<CompletionUpdate, RuntimeError>> = self
            .chunks
            .iter()
            .map(|c| Ok(CompletionUpdate::text(c.clone())))
            .collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(RuntimeError::Status {
                status: 500,
                body: "stream reset".to_string(),
            }));
        }

        let updates = stream::iter(items).map(move |item| {
            let _alive = &guard;
            item
        });
        Ok(updates.boxed())
    }
}

#[derive(Default)]
pub struct StubManager {
    pub client: Arc<StubClient>,
    pub starts: AtomicUsize,
    pub shutdowns: AtomicUsize,
    /// Number of initial `start_model` calls that fail.
    pub fail_starts: AtomicUsize,
    pub start_delay: Option<Duration>,
}

impl StubManager {
    pub fn new(client: StubClient) -> Self {
        Self {
            client: Arc::new(client),
            ..Self::default()
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeManager for StubManager {
    async fn start_model(&self, _alias: &str) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.fail_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::ServiceUnavailable("service starting".to_string()));
        }
        Ok(())
    }

    async fn model_info(&self, alias: &str) -> Result<Option<ModelInfo>, RuntimeError> {
        Ok(Some(ModelInfo {
            id: format!("{alias}-instruct-generic-cpu:1"),
            alias: alias.to_string(),
            device: Some("CPU".to_string()),
        }))
    }

    async fn connection(&self) -> Result<Connection, RuntimeError> {
        Ok(Connection {
            endpoint: "http://127.0.0.1:5273/v1".to_string(),
            api_key: "notneeded".to_string(),
        })
    }

    fn completion_client(
        &self,
        _connection: &Connection,
        _model_id: &str,
    ) -> Result<Arc<dyn CompletionClient>, RuntimeError> {
        Ok(self.client.clone())
    }

    async fn shutdown(&self, _model_id: Option<&str>) -> Result<(), RuntimeError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
