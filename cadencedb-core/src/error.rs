//! Error types for CadenceDB

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for CadenceDB operations
pub type Result<T> = std::result::Result<T, CadenceError>;

/// CadenceDB error types
#[derive(Error, Debug)]
pub enum CadenceError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IO operation on a specific datapoint file or directory failed
    #[error("{op} failed on {}: {source}", path.display())]
    File {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Series labels cannot form a key
    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    /// Read range is malformed
    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange { start: i64, end: i64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker's task queue is full
    #[error("Worker {worker} is too busy")]
    WorkerTooBusy { worker: usize },

    /// A task was dropped before producing a result
    #[error("Worker stopped before the task completed")]
    WorkerStopped,

    /// A datapoint lands inside an existing file's range but not on its cadence
    #[error("Datapoint at {timestamp} (duration {duration}) does not fit {file}: {reason}")]
    Unrepresentable {
        timestamp: i64,
        duration: i64,
        file: String,
        reason: &'static str,
    },

    /// A flush stored everything except datapoints no file could hold
    #[error("{count} datapoints rejected, first: {first}")]
    Rejected {
        count: usize,
        #[source]
        first: Box<CadenceError>,
    },

    /// Failure while operating on a series
    #[error("Series {key}: {source}")]
    Series {
        key: String,
        #[source]
        source: Box<CadenceError>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CadenceError {
    /// Wrap an io::Error with the operation and path that produced it
    pub fn file(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CadenceError::File {
            op,
            path: path.into(),
            source,
        }
    }

    /// Attach a series key to an error raised while serving that series
    pub fn for_series(self, key: &str) -> Self {
        match self {
            err @ CadenceError::Series { .. } => err,
            err => CadenceError::Series {
                key: key.to_string(),
                source: Box::new(err),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            CadenceError::WorkerTooBusy { .. } => true,
            CadenceError::Io(e) | CadenceError::File { source: e, .. } => {
                e.kind() == std::io::ErrorKind::Interrupted
            }
            CadenceError::Series { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if error was caused by a bad request rather than the engine
    pub fn is_invalid_request(&self) -> bool {
        match self {
            CadenceError::InvalidSeries(_)
            | CadenceError::InvalidRange { .. }
            | CadenceError::Unrepresentable { .. }
            | CadenceError::Rejected { .. } => true,
            CadenceError::Series { source, .. } => source.is_invalid_request(),
            _ => false,
        }
    }
}
