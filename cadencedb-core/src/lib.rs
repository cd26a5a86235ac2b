//! CadenceDB Core - Adaptive Time-Series Storage Engine
//!
//! Datapoints are `(timestamp, value, duration)` samples grouped into series
//! by label set. Each series is stored as a directory of files whose encoding
//! follows the shape of the data.
//!
//! # Architecture
//!
//! - **Write buffer**: paged, append-only staging area per series
//! - **Datapoint files**: dense (fixed cadence), sparse (raw records) and
//!   constant (name-only) encodings, described entirely by their file names
//! - **Directory**: the sorted, non-overlapping set of files for one series
//! - **Optimizer**: rewrites large sparse files as dense or constant files
//! - **Workers**: every series is pinned to one worker thread, so per-series
//!   state is only ever touched by one thread
//! - **Flusher**: background thread draining the largest write buffers first

pub mod buffer;
pub mod directory;
pub mod files;
pub mod float;
pub mod ops;
pub mod optimizer;
pub mod series;
pub mod storage;
pub mod worker;

mod error;
mod types;

pub use error::{CadenceError, Result};
pub use storage::{ReadRequest, StorageConfig, StorageEngine};
pub use types::*;

/// CadenceDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Largest NaN gap a dense write will pad
    pub const MAX_DENSE_NAN_GAP: u64 = 256;

    /// Largest hole allowed when classifying data as dense
    pub const MAX_DENSE_NAN_PADDING: u64 = 256;

    pub const MIN_DATAPOINTS_FOR_DENSE: usize = 32;

    pub const MIN_DATAPOINTS_FOR_CONSTANT: usize = 32;

    /// Sparse file size that triggers optimization (1MB)
    pub const SPARSE_FILE_OPTIMIZE_SIZE: u64 = 1024 * 1024;

    /// Maximum sparse file size (4MB)
    pub const SPARSE_FILE_MAX_SIZE: u64 = 4 * 1024 * 1024;

    /// System pages per write buffer allocation
    pub const WRITE_BUFFER_PAGES_PER_ALLOC: usize = 1;

    /// Datapoints per read chunk (1MB of records)
    pub const READ_BUFFER_SIZE: usize = 1024 * 1024 / crate::DATAPOINT_SIZE;

    pub const WORKER_THREADS: usize = 64;

    pub const WORKER_QUEUE_LIMIT: usize = 1024;

    pub const DATAPOINT_FILE_MODE: u32 = 0o644;

    pub const FLUSHER_RESORT_INTERVAL: Duration = Duration::from_secs(5);

    pub const FLUSHER_IDLE_SLEEP: Duration = Duration::from_secs(5);
}
