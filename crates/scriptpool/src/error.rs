//! Error types for scriptpool.
//!
//! `FrameError` covers the byte-level channel protocol; `PoolError` is what
//! callers of `Pool` and `Worker` see, grouped into the categories returned
//! by [`PoolError::category`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which part of a frame was being read when the stream ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Header,
    Payload,
}

impl std::fmt::Display for FrameStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStage::Header => write!(f, "length prefix"),
            FrameStage::Payload => write!(f, "payload"),
        }
    }
}

/// Errors produced by the frame codec and the handshake.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame truncated in {stage}: expected {expected} bytes, got {actual}")]
    Truncated {
        stage: FrameStage,
        expected: u64,
        actual: u64,
    },

    #[error("Frame payload of {len} bytes exceeds the maximum frame length")]
    TooLarge { len: usize },

    #[error("Unexpected handshake: received {received:?}")]
    BadHandshake { received: Vec<u8> },

    #[error("Channel IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`PoolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Workspace, channel, spawn or handshake failure.
    Setup,
    /// Write or read failure on the channel mid-call.
    Transport,
    /// No result within the call timeout.
    Timeout,
    /// Malformed request/response payload or a remote-reported failure.
    Payload,
    /// The worker process exited or was killed.
    ProcessDeath,
    /// The worker or pool has been shut down.
    Closed,
}

/// Main error type for scriptpool.
#[derive(Debug, Error)]
pub enum PoolError {
    // Setup errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Interpreter executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("Workspace error at {path:?}: {message}")]
    Workspace {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Channel setup failed: {message}")]
    Channel {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to spawn worker {worker}: {message}")]
    Spawn {
        worker: usize,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Worker {worker} handshake failed: {message}")]
    Handshake { worker: usize, message: String },

    // Call errors
    #[error("Worker {worker} transport error: {source}")]
    Transport {
        worker: usize,
        #[source]
        source: FrameError,
    },

    #[error("Worker {worker} call to '{function}' timed out after {timeout:?}")]
    Timeout {
        worker: usize,
        function: String,
        timeout: Duration,
    },

    #[error("Worker {worker} died: {cause}")]
    WorkerDied { worker: usize, cause: String },

    // Payload errors
    #[error("Failed to encode argument for '{function}': {message}")]
    Encode { function: String, message: String },

    #[error("Failed to decode result of '{function}': {message}")]
    Decode { function: String, message: String },

    #[error("Remote function '{function}' failed: {message}")]
    Remote { function: String, message: String },

    #[error("Worker {worker} is closed")]
    Closed { worker: usize },
}

/// Result type alias for scriptpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Create a workspace IO error with path context.
    pub fn workspace_io(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        err: std::io::Error,
    ) -> Self {
        PoolError::Workspace {
            message: message.into(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PoolError::Config { .. }
            | PoolError::ExecutableNotFound(_)
            | PoolError::Workspace { .. }
            | PoolError::Channel { .. }
            | PoolError::Spawn { .. }
            | PoolError::Handshake { .. } => ErrorCategory::Setup,

            PoolError::Transport { .. } => ErrorCategory::Transport,
            PoolError::Timeout { .. } => ErrorCategory::Timeout,

            PoolError::Encode { .. } | PoolError::Decode { .. } | PoolError::Remote { .. } => {
                ErrorCategory::Payload
            }

            PoolError::WorkerDied { .. } => ErrorCategory::ProcessDeath,
            PoolError::Closed { .. } => ErrorCategory::Closed,
        }
    }

    /// Whether this error ended the worker incarnation that produced it.
    pub fn retires_worker(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Timeout | ErrorCategory::ProcessDeath
        )
    }

    /// Check if issuing the call again may succeed.
    ///
    /// A retired worker is restarted by the next call, so transport, timeout
    /// and death errors are retryable. Setup errors are not.
    pub fn is_retryable(&self) -> bool {
        self.retires_worker()
    }
}
