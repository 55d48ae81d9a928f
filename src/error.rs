// Error types for the capture and persistence pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Result type for logger operations
pub type Result<T> = std::result::Result<T, LoggerError>;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("writer is closed; record {request_id} was not queued")]
    Closed { request_id: String },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record {request_id}: {source}")]
    Serialize {
        request_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist batch of {records} records after {attempts} attempts: {source}")]
    PersistFailed {
        records: usize,
        attempts: u32,
        #[source]
        source: Box<LoggerError>,
    },

    #[error("background write task failed: {0}")]
    Task(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("proxy server error: {0}")]
    Server(String),
}

impl LoggerError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn serialize(request_id: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialize {
            request_id: request_id.into(),
            source,
        }
    }
}
