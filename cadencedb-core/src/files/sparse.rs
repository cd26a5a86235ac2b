//! Sparse datapoint files
//!
//! A sparse file is an append-only log of raw 24-byte datapoint records in
//! write order. It accepts any shape of data and is the only format the
//! write path creates directly.

use super::{io, NameParser};
use crate::ops::{ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{Datapoint, Result, Timestamp, DATAPOINT_SIZE};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const OPTIMIZED_SUFFIX: &str = ".opt";

/// Append-only file named `<min_timestamp>-<max_timestamp>[.opt]`.
///
/// Both bounds are inclusive timestamps of records actually written.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseFile {
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    optimized: bool,
    size_bytes: u64,
}

impl SparseFile {
    /// A file that will start at `timestamp` once written
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            min_timestamp: timestamp,
            max_timestamp: timestamp,
            optimized: false,
            size_bytes: 0,
        }
    }

    /// Describe an existing sparse file
    pub fn open(dir: &Path, min: Timestamp, max: Timestamp, optimized: bool) -> Result<Self> {
        let mut file = Self {
            min_timestamp: min,
            max_timestamp: max,
            optimized,
            size_bytes: 0,
        };
        file.size_bytes = io::file_size(&file.path(dir))?;
        Ok(file)
    }

    /// Parse `<min_timestamp>-<max_timestamp>` with an optional `.opt` suffix
    pub fn parse_filename(name: &str) -> Option<(Timestamp, Timestamp, bool)> {
        let mut parser = NameParser::new(name);
        let min = parser.int()?;
        parser.expect('-')?;
        let max = parser.int()?;
        let optimized = match parser.rest() {
            "" => false,
            OPTIMIZED_SUFFIX => true,
            _ => return None,
        };
        (min <= max).then_some((min, max, optimized))
    }

    pub fn file_name(&self) -> String {
        let suffix = if self.optimized { OPTIMIZED_SUFFIX } else { "" };
        format!("{}-{}{}", self.min_timestamp, self.max_timestamp, suffix)
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    /// Largest timestamp written so far (inclusive)
    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Records that fit before the file reaches its hard size cap
    pub fn remaining_writable_datapoints(&self, config: &StorageConfig) -> usize {
        (config.sparse_file_max_size.saturating_sub(self.size_bytes) / DATAPOINT_SIZE as u64)
            as usize
    }

    /// True once the file has grown past the optimize threshold and has not been reviewed
    pub fn needs_optimization(&self, config: &StorageConfig) -> bool {
        !self.optimized && self.size_bytes >= config.sparse_file_optimize_size
    }

    /// Rename the file with the `.opt` suffix
    pub fn mark_optimized(&mut self, dir: &Path) -> Result<()> {
        if self.optimized {
            return Ok(());
        }
        let from = self.path(dir);
        self.optimized = true;
        let to = self.path(dir);
        if let Err(e) = io::rename(&from, &to) {
            self.optimized = false;
            return Err(e);
        }
        debug!("Marked {} for optimization", to.display());
        Ok(())
    }

    /// Load every record (up to the size cap) in timestamp order.
    ///
    /// The sort is stable, so records sharing a timestamp stay in write order.
    fn load_sorted(&self, dir: &Path, config: &StorageConfig) -> Result<Vec<Datapoint>> {
        let path = self.path(dir);
        let mut file = io::open_for_read(&path)?;
        let size = file
            .metadata()
            .map_err(|e| crate::CadenceError::file("stat", &path, e))?
            .len();
        if size > config.sparse_file_max_size {
            warn!(
                "Sparse file {} is {} bytes, reading only the first {}",
                path.display(),
                size,
                config.sparse_file_max_size
            );
        }

        let count = (size.min(config.sparse_file_max_size) / DATAPOINT_SIZE as u64) as usize;
        let mut records: Vec<Datapoint> = io::read_values(&mut file, &path, count)?;
        records.sort();
        Ok(records)
    }

    /// Emit one datapoint per distinct timestamp in `[op.next_time(), op.end_time())`.
    ///
    /// For a run of records sharing a timestamp, the first written record fixes
    /// the duration. The latest record with that duration supplies the value.
    pub fn read(&self, dir: &Path, op: &mut ReadOperation, config: &StorageConfig) -> Result<()> {
        let records = self.load_sorted(dir, config)?;

        let mut i = records.partition_point(|p| p.timestamp < op.next_time());
        while i < records.len() && records[i].timestamp < op.end_time() && op.wants_more() {
            let timestamp = records[i].timestamp;
            let run_end = i + records[i..].partition_point(|p| p.timestamp == timestamp);

            // Points covered by the previous point's duration are not emitted
            if timestamp >= op.next_time() {
                op.append(resolve_duplicates(&records[i..run_end]));
            }
            i = run_end;
        }
        Ok(())
    }

    /// Append as many writable datapoints as the size cap allows.
    ///
    /// Returns how many were written; zero means the file is full.
    pub fn write(
        &mut self,
        dir: &Path,
        op: &WriteOperation<'_>,
        config: &StorageConfig,
    ) -> Result<usize> {
        let count = op
            .writable_datapoints()
            .min(self.remaining_writable_datapoints(config));
        if count == 0 {
            return Ok(0);
        }

        let spans: Vec<&[u8]> = op
            .spans(count)
            .into_iter()
            .map(bytemuck::cast_slice)
            .collect();

        let path = self.path(dir);
        let mut file = io::open_for_write(&path, config.datapoint_file_mode, true)?;
        io::write_all_vectored(&mut file, &path, &spans)?;
        self.size_bytes += (count * DATAPOINT_SIZE) as u64;

        let written_max = op
            .points(count)
            .map(|p| p.timestamp)
            .max()
            .unwrap_or(self.max_timestamp);
        if written_max > self.max_timestamp {
            let previous = self.max_timestamp;
            self.max_timestamp = written_max;
            let renamed = self.path(dir);
            if let Err(e) = io::rename(&path, &renamed) {
                self.max_timestamp = previous;
                return Err(e);
            }
        }

        Ok(count)
    }
}

/// Pick the record to emit for a run sharing one timestamp
fn resolve_duplicates(run: &[Datapoint]) -> Datapoint {
    let original = run[0];
    run.iter()
        .rev()
        .find(|p| p.duration == original.duration)
        .copied()
        .unwrap_or(original)
}
