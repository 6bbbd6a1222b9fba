//! Lazily initialized, shared model client.
//!
//! The first caller of [`LazyModelClient::ensure_ready`] spawns the
//! initialization task: start the model, resolve its id, fetch the connection
//! and build a completion client. Everyone else either finds the cached
//! [`ClientHandle`] (lock-free) or awaits the same in-flight task.
//!
//! ```text
//! Uninitialized ──► Initializing ──► Ready
//!                        │
//!                        └────────► Failed ──► Initializing (next call)
//! ```
//!
//! The task belongs to the client, not to the caller that started it. A caller
//! that goes away (dropped future, cancelled token) only stops waiting. The
//! task ends on success, on failure, on its timeout, or when
//! [`LazyModelClient::shutdown`] stops it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ChatError;
use crate::runtime::{CompletionClient, RuntimeError, RuntimeManager};

/// The initialized state: a completion client plus what it is bound to.
pub struct ClientHandle {
    client: Arc<dyn CompletionClient>,
    model_id: String,
    endpoint: String,
}

impl ClientHandle {
    pub(crate) fn client(&self) -> &dyn CompletionClient {
        self.client.as_ref()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("model_id", &self.model_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    ShutDown,
}

/// Outcome of one initialization task, shared by every caller awaiting it.
#[derive(Debug, Clone)]
enum InitError {
    Failed(Arc<RuntimeError>),
    Timeout(Duration),
    ShutDown,
}

impl From<InitError> for ChatError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::Failed(e) => ChatError::InitializationFailed(e),
            InitError::Timeout(limit) => ChatError::Timeout(limit),
            InitError::ShutDown => ChatError::ShutDown,
        }
    }
}

type InitResult = Result<Arc<ClientHandle>, InitError>;
type PendingInit = Shared<BoxFuture<'static, InitResult>>;

enum Phase {
    Uninitialized,
    Initializing { attempt: u64, pending: PendingInit },
    Failed { last_error: String },
    Ready,
    ShutDown,
}

fn lock(phase: &Mutex<Phase>) -> MutexGuard<'_, Phase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LazyModelClient {
    manager: Arc<dyn RuntimeManager>,
    alias: String,
    handle: Arc<OnceLock<Arc<ClientHandle>>>,
    shut_down: AtomicBool,
    phase: Arc<Mutex<Phase>>,
    attempts: AtomicU64,
    /// Stops an in-flight initialization task at shutdown.
    stop: CancellationToken,
}

impl LazyModelClient {
    pub fn new(manager: Arc<dyn RuntimeManager>, alias: impl Into<String>) -> Self {
        Self {
            manager,
            alias: alias.into(),
            handle: Arc::new(OnceLock::new()),
            shut_down: AtomicBool::new(false),
            phase: Arc::new(Mutex::new(Phase::Uninitialized)),
            attempts: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Number of initialization tasks started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// The cached handle, if initialization has succeeded and teardown has not run.
    pub fn handle(&self) -> Option<Arc<ClientHandle>> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        self.handle.get().cloned()
    }

    pub fn state(&self) -> ClientState {
        match *lock(&self.phase) {
            Phase::Uninitialized => ClientState::Uninitialized,
            Phase::Initializing { .. } => ClientState::Initializing,
            Phase::Failed { .. } => ClientState::Failed,
            Phase::Ready => ClientState::Ready,
            Phase::ShutDown => ClientState::ShutDown,
        }
    }

    /// Message of the most recent failed initialization, if the last attempt failed.
    pub fn last_error(&self) -> Option<String> {
        match &*lock(&self.phase) {
            Phase::Failed { last_error } => Some(last_error.clone()),
            _ => None,
        }
    }

    /// Return the shared handle, initializing it on first use.
    ///
    /// `timeout` bounds a task started by this call. Callers that join a task
    /// already in flight wait for its outcome. Cancelling `cancel` returns
    /// [`ChatError::Cancelled`] to this caller and leaves the task running.
    pub async fn ensure_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<ClientHandle>, ChatError> {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }

        let pending = {
            let mut phase = lock(&self.phase);
            let in_flight = match &*phase {
                Phase::ShutDown => return Err(ChatError::ShutDown),
                Phase::Ready => {
                    if let Some(handle) = self.handle.get() {
                        return Ok(handle.clone());
                    }
                    None
                }
                Phase::Initializing { pending, .. } => Some(pending.clone()),
                Phase::Uninitialized | Phase::Failed { .. } => None,
            };
            match in_flight {
                Some(pending) => pending,
                None => self.begin(&mut phase, timeout),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            outcome = pending => outcome.map_err(ChatError::from),
        }
    }

    /// Spawn a new initialization task and record it as in flight.
    fn begin(&self, phase: &mut Phase, timeout: Duration) -> PendingInit {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(alias = %self.alias, attempt, "Initializing model client");

        let task = InitTask {
            manager: self.manager.clone(),
            alias: self.alias.clone(),
            phase: self.phase.clone(),
            handle: self.handle.clone(),
            stop: self.stop.clone(),
            attempt,
            timeout,
        };
        let join = tokio::spawn(task.run());

        let pending = async move {
            join.await.unwrap_or_else(|e| {
                Err(InitError::Failed(Arc::new(RuntimeError::Task(e.to_string()))))
            })
        }
        .boxed()
        .shared();

        *phase = Phase::Initializing {
            attempt,
            pending: pending.clone(),
        };
        pending
    }

    /// Tear down the runtime manager. Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut phase = lock(&self.phase);
            if matches!(*phase, Phase::ShutDown) {
                return;
            }
            self.shut_down.store(true, Ordering::Release);
            *phase = Phase::ShutDown;
        }
        self.stop.cancel();

        let model_id = self.handle.get().map(|h| h.model_id.clone());
        match self.manager.shutdown(model_id.as_deref()).await {
            Ok(()) => info!(alias = %self.alias, "Model client shut down"),
            Err(e) => warn!(alias = %self.alias, "Model runtime shutdown failed: {e}"),
        }
    }
}

/// One initialization attempt, owned by a spawned task.
struct InitTask {
    manager: Arc<dyn RuntimeManager>,
    alias: String,
    phase: Arc<Mutex<Phase>>,
    handle: Arc<OnceLock<Arc<ClientHandle>>>,
    stop: CancellationToken,
    attempt: u64,
    timeout: Duration,
}

impl InitTask {
    async fn run(self) -> InitResult {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(InitError::ShutDown),
            result = tokio::time::timeout(self.timeout, initialize(self.manager.as_ref(), &self.alias)) => {
                match result {
                    Ok(Ok(handle)) => Ok(Arc::new(handle)),
                    Ok(Err(e)) => Err(InitError::Failed(Arc::new(e))),
                    Err(_) => Err(InitError::Timeout(self.timeout)),
                }
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut phase = lock(&self.phase);
        let current = matches!(
            *phase,
            Phase::Initializing { attempt, .. } if attempt == self.attempt
        );

        match outcome {
            Ok(handle) => {
                let handle = self.handle.get_or_init(|| handle).clone();
                if current {
                    *phase = Phase::Ready;
                }
                info!(
                    alias = %self.alias,
                    model_id = %handle.model_id,
                    endpoint = %handle.endpoint,
                    elapsed_ms,
                    "Model client ready"
                );
                Ok(handle)
            }
            Err(InitError::ShutDown) => {
                warn!(alias = %self.alias, attempt = self.attempt, "Model initialization stopped by shutdown");
                Err(InitError::ShutDown)
            }
            Err(e) => {
                let message = ChatError::from(e.clone()).to_string();
                error!(
                    alias = %self.alias,
                    attempt = self.attempt,
                    elapsed_ms,
                    "{message}"
                );
                if current {
                    *phase = Phase::Failed {
                        last_error: message,
                    };
                }
                Err(e)
            }
        }
    }
}

async fn initialize(manager: &dyn RuntimeManager, alias: &str) -> Result<ClientHandle, RuntimeError> {
    manager.start_model(alias).await?;

    let model_id = manager
        .model_info(alias)
        .await?
        .map(|info| info.id)
        .ok_or_else(|| RuntimeError::ModelNotFound(alias.to_string()))?;

    let connection = manager.connection().await?;
    let client = manager.completion_client(&connection, &model_id)?;

    Ok(ClientHandle {
        client,
        model_id,
        endpoint: connection.endpoint,
    })
}
