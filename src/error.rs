//! Error taxonomy for chat operations.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::runtime::RuntimeError;

#[derive(Error, Debug)]
pub enum ChatError {
    /// The caller sent something we refuse to forward.
    #[error("{0}")]
    InvalidArgument(String),

    /// Initialization did not complete within its bound.
    #[error("Model initialization timed out after {0:?}")]
    Timeout(Duration),

    /// The runtime or the completion client could not be brought up.
    #[error("Model initialization failed: {0}")]
    InitializationFailed(#[source] Arc<RuntimeError>),

    /// A completion call failed or produced no usable content.
    #[error("Upstream completion failed: {0}")]
    Upstream(String),

    /// The caller gave up before the operation finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// The client has been torn down.
    #[error("Model client has been shut down")]
    ShutDown,
}

impl ChatError {
    /// Whether the caller can fix this by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ChatError::InvalidArgument(_))
    }

    /// Whether a later call may succeed without any change on the caller side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Timeout(_) | ChatError::InitializationFailed(_) | ChatError::Cancelled
        )
    }

    /// Stable machine-readable name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::InvalidArgument(_) => "invalid_argument",
            ChatError::Timeout(_) => "timeout",
            ChatError::InitializationFailed(_) => "initialization_failed",
            ChatError::Upstream(_) => "upstream_error",
            ChatError::Cancelled => "cancelled",
            ChatError::ShutDown => "shut_down",
        }
    }
}

impl From<RuntimeError> for ChatError {
    fn from(err: RuntimeError) -> Self {
        ChatError::Upstream(err.to_string())
    }
}
