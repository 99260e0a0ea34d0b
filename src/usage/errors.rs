//! Usage tracker error types.

use thiserror::Error;

/// Errors from reading or writing the usage log.
#[derive(Debug, Error)]
pub enum UsageError {
    /// Reading or writing the log file failed.
    #[error("usage log I/O error at '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The log file exists but is not a JSON array of entries.
    #[error("usage log serialization error: {reason}")]
    Serialization { reason: String },
}

impl From<serde_json::Error> for UsageError {
    fn from(e: serde_json::Error) -> Self {
        UsageError::Serialization {
            reason: e.to_string(),
        }
    }
}
