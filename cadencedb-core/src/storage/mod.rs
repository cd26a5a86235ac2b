//! Storage engine - series registry, worker dispatch and background flushing

mod engine;
mod flusher;

pub use engine::{EngineStats, StorageEngine};

use crate::{CadenceError, Result, Timestamp, DATAPOINT_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory; series live under `<data_dir>/datapoints/`
    pub data_dir: PathBuf,
    /// Most NaN slots a dense write may insert before the next value
    pub max_dense_nan_gap: u64,
    /// Most empty slots between two points for data to count as dense
    pub max_dense_nan_padding: u64,
    pub min_datapoints_for_dense: usize,
    pub min_datapoints_for_constant: usize,
    /// Sparse file size in bytes at which it is handed to the optimizer
    pub sparse_file_optimize_size: u64,
    /// Hard cap on a sparse file's size in bytes
    pub sparse_file_max_size: u64,
    /// Write buffer pages are this many system pages
    pub write_buffer_pages_per_alloc: usize,
    /// Datapoints per read chunk
    pub read_buffer_size: usize,
    pub worker_threads: usize,
    /// Pending tasks a worker accepts before refusing more
    pub worker_queue_limit: usize,
    /// Permission bits for new datapoint files
    pub datapoint_file_mode: u32,
    /// How long the flusher works through one ranking before re-ranking
    pub flusher_resort_interval: Duration,
    /// Flusher sleep after a round that flushed nothing
    pub flusher_idle_sleep: Duration,
    /// Run the background flusher thread
    pub background_flush: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        use crate::config;

        Self {
            data_dir: PathBuf::from("data"),
            max_dense_nan_gap: config::MAX_DENSE_NAN_GAP,
            max_dense_nan_padding: config::MAX_DENSE_NAN_PADDING,
            min_datapoints_for_dense: config::MIN_DATAPOINTS_FOR_DENSE,
            min_datapoints_for_constant: config::MIN_DATAPOINTS_FOR_CONSTANT,
            sparse_file_optimize_size: config::SPARSE_FILE_OPTIMIZE_SIZE,
            sparse_file_max_size: config::SPARSE_FILE_MAX_SIZE,
            write_buffer_pages_per_alloc: config::WRITE_BUFFER_PAGES_PER_ALLOC,
            read_buffer_size: config::READ_BUFFER_SIZE,
            worker_threads: config::WORKER_THREADS,
            worker_queue_limit: config::WORKER_QUEUE_LIMIT,
            datapoint_file_mode: config::DATAPOINT_FILE_MODE,
            flusher_resort_interval: config::FLUSHER_RESORT_INTERVAL,
            flusher_idle_sleep: config::FLUSHER_IDLE_SLEEP,
            background_flush: true,
        }
    }
}

impl StorageConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CadenceError::Config(msg.to_string()));

        if self.worker_threads == 0 {
            return fail("worker_threads must be at least 1");
        }
        if self.worker_queue_limit == 0 {
            return fail("worker_queue_limit must be at least 1");
        }
        if self.read_buffer_size == 0 {
            return fail("read_buffer_size must be at least 1");
        }
        if self.write_buffer_pages_per_alloc == 0 {
            return fail("write_buffer_pages_per_alloc must be at least 1");
        }
        if self.sparse_file_max_size < DATAPOINT_SIZE as u64 {
            return fail("sparse_file_max_size must hold at least one datapoint");
        }
        if self.sparse_file_optimize_size > self.sparse_file_max_size {
            return fail("sparse_file_optimize_size must not exceed sparse_file_max_size");
        }
        if self.min_datapoints_for_dense == 0 {
            return fail("min_datapoints_for_dense must be at least 1");
        }
        if self.min_datapoints_for_constant == 0 {
            return fail("min_datapoints_for_constant must be at least 1");
        }
        if self.datapoint_file_mode > 0o7777 {
            return fail("datapoint_file_mode must be a permission mask");
        }
        Ok(())
    }
}

/// Range read against one series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Inclusive start
    pub start: Timestamp,
    /// Exclusive end
    pub end: Timestamp,
    /// Most datapoints to return
    #[serde(default)]
    pub limit: Option<u64>,
    /// Apply `limit` to the end of the range instead of the start
    #[serde(default)]
    pub prefer_latest: bool,
}

impl ReadRequest {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end,
            limit: None,
            prefer_latest: false,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn latest(mut self) -> Self {
        self.prefer_latest = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(CadenceError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}
