//! Bridge error types.
//!
//! Every failure a caller can observe is a `BridgeError`. Callers that need
//! to decide whether to retry should branch on [`BridgeError::kind`] or
//! [`BridgeError::retry_strategy`] rather than on the rendered message.

use thiserror::Error;

/// Errors surfaced to callers of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No active child connection, or the channel to it is broken.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// The child process could not be started (or died during startup).
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The child answered with a JSON-RPC `error` object.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the call's deadline.
    #[error("call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The child exited while the call was outstanding.
    #[error("process terminated: {reason}")]
    ProcessTerminated { reason: String },

    /// Invalid or unreadable bridge configuration.
    #[error("config error: {reason}")]
    Config { reason: String },
}

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Remote,
    Timeout,
    ProcessTerminated,
    Config,
}

/// What a caller should do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry straight away.
    Immediate,
    /// Do not retry; the failure is deterministic.
    Never,
    /// Retry after an increasing delay.
    Backoff,
    /// Re-establish the child process, then retry.
    Reconnect,
}

impl BridgeError {
    pub fn transport(reason: impl Into<String>) -> Self {
        BridgeError::Transport {
            reason: reason.into(),
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        BridgeError::ProcessTerminated {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        BridgeError::Config {
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Transport { .. } | BridgeError::SpawnFailed { .. } => ErrorKind::Transport,
            BridgeError::Remote { .. } => ErrorKind::Remote,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::ProcessTerminated { .. } => ErrorKind::ProcessTerminated,
            BridgeError::Config { .. } => ErrorKind::Config,
        }
    }

    /// Recommended retry behaviour for this error.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self.kind() {
            ErrorKind::Transport => RetryStrategy::Immediate,
            ErrorKind::Remote | ErrorKind::Config => RetryStrategy::Never,
            ErrorKind::Timeout => RetryStrategy::Backoff,
            ErrorKind::ProcessTerminated => RetryStrategy::Reconnect,
        }
    }
}

/// A line on the child's stdout that is not a protocol message.
///
/// Recovered inside the framer; never handed to a pending call.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("JSON object matches no known message shape")]
    UnknownShape,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
