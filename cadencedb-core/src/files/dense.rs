//! Dense datapoint files
//!
//! A dense file holds one 8-byte value per tick of a fixed cadence starting at
//! `min_timestamp`. Timestamps are implied by position and missing samples are
//! stored as NaN, which never reaches a reader.

use super::{align_up, io, NameParser};
use crate::ops::{ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{CadenceError, Datapoint, Result, Timestamp};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const VALUE_SIZE: u64 = std::mem::size_of::<f64>() as u64;

/// Slots read from disk per syscall
const READ_CHUNK_SLOTS: usize = 4096;

/// Fixed-cadence file named `<min_timestamp>@<duration>`
#[derive(Debug, Clone, PartialEq)]
pub struct DenseFile {
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    duration: i64,
}

impl DenseFile {
    /// An empty dense file that has not been written yet
    pub fn new(min_timestamp: Timestamp, duration: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp: min_timestamp,
            duration,
        }
    }

    /// Describe an existing dense file, deriving its range from its size
    pub fn open(dir: &Path, min_timestamp: Timestamp, duration: i64) -> Result<Self> {
        let mut file = Self::new(min_timestamp, duration);
        let slots = io::file_size(&file.path(dir))? / VALUE_SIZE;
        file.max_timestamp = file.timestamp_of(slots as i64);
        Ok(file)
    }

    /// Parse `<min_timestamp>@<duration>`
    pub fn parse_filename(name: &str) -> Option<(Timestamp, i64)> {
        let mut parser = NameParser::new(name);
        let min = parser.int()?;
        parser.expect('@')?;
        let duration = parser.int()?;
        parser.finish()?;
        (duration > 0).then_some((min, duration))
    }

    pub fn file_name(&self) -> String {
        format!("{}@{}", self.min_timestamp, self.duration)
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    /// Exclusive end of the slots held on disk
    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// Number of slots, NaN or not, held on disk
    pub fn slot_count(&self) -> i64 {
        (self.max_timestamp - self.min_timestamp) / self.duration
    }

    fn timestamp_of(&self, slot: i64) -> Timestamp {
        self.min_timestamp.saturating_add(slot.saturating_mul(self.duration))
    }

    /// Slot a datapoint can be stored in, if it matches this file's cadence
    fn slot_for(&self, point: &Datapoint) -> Option<i64> {
        if point.duration != self.duration || point.timestamp < self.min_timestamp {
            return None;
        }
        let offset = point.timestamp - self.min_timestamp;
        (offset % self.duration == 0).then_some(offset / self.duration)
    }

    /// Emit every non-NaN slot in `[op.next_time(), op.end_time())`
    pub fn read(&self, dir: &Path, op: &mut ReadOperation) -> Result<()> {
        let start = op.next_time().max(self.min_timestamp);
        let Some(start) = align_up(start, self.min_timestamp, self.duration) else {
            return Ok(());
        };
        let end = self.max_timestamp.min(op.end_time());
        if start >= end {
            return Ok(());
        }

        let mut slot = (start - self.min_timestamp) / self.duration;
        let end_slot = (end - self.min_timestamp + self.duration - 1) / self.duration;

        let path = self.path(dir);
        let mut file = io::open_for_read(&path)?;
        file.seek(SeekFrom::Start(slot as u64 * VALUE_SIZE))
            .map_err(|e| CadenceError::file("seek", &path, e))?;

        while slot < end_slot && op.wants_more() {
            let want = ((end_slot - slot) as usize).min(READ_CHUNK_SLOTS);
            let values: Vec<f64> = io::read_values(&mut file, &path, want)?;
            if values.is_empty() {
                break;
            }

            for value in values {
                if !value.is_nan() {
                    if !op.wants_more() {
                        return Ok(());
                    }
                    op.append(Datapoint::new(self.timestamp_of(slot), value, self.duration));
                }
                slot += 1;
            }
        }
        Ok(())
    }

    /// Write the longest prefix of the operation this file can represent.
    ///
    /// Points must share the file's duration and land on its cadence. The
    /// write stops at the first point that does not, or when reaching the next
    /// point would need more than `max_dense_nan_gap` NaN slots. A point inside
    /// the range already on disk that does not fit is an
    /// [`CadenceError::Unrepresentable`] error when it is the first one offered.
    /// Returns how many datapoints were consumed.
    pub fn write(
        &mut self,
        dir: &Path,
        op: &WriteOperation<'_>,
        config: &StorageConfig,
    ) -> Result<usize> {
        let writable = op.writable_datapoints();
        if writable == 0 {
            return Ok(0);
        }

        let old_slots = self.slot_count();
        let mut frontier = old_slots;
        let mut placed: Vec<(i64, f64)> = Vec::new();

        for point in op.points(writable) {
            let Some(slot) = self.slot_for(&point) else {
                if point.timestamp < self.max_timestamp && placed.is_empty() {
                    return Err(self.misfit(&point));
                }
                break;
            };

            if slot > frontier && (slot - frontier) as u64 > config.max_dense_nan_gap {
                debug!(
                    "NaN gap of {} slots before {} is too large for {}",
                    slot - frontier,
                    point.timestamp,
                    self.file_name()
                );
                break;
            }

            placed.push((slot, point.value));
            frontier = frontier.max(slot + 1);
        }

        let consumed = placed.len();
        let Some(&(first_slot, _)) = placed.first() else {
            return Ok(0);
        };

        // Rewrite from the first touched slot (or the old end, to pad the gap)
        // through the last new slot.
        let start_slot = first_slot.min(old_slots);
        let mut values = vec![f64::NAN; (frontier - start_slot) as usize];

        let path = self.path(dir);
        if start_slot < old_slots {
            let mut file = io::open_for_read(&path)?;
            file.seek(SeekFrom::Start(start_slot as u64 * VALUE_SIZE))
                .map_err(|e| CadenceError::file("seek", &path, e))?;
            let keep = (old_slots.min(frontier) - start_slot) as usize;
            let existing: Vec<f64> = io::read_values(&mut file, &path, keep)?;
            values[..existing.len()].copy_from_slice(&existing);
        }
        for (slot, value) in placed {
            values[(slot - start_slot) as usize] = value;
        }

        let mut file = io::open_for_write(&path, config.datapoint_file_mode, false)?;
        file.seek(SeekFrom::Start(start_slot as u64 * VALUE_SIZE))
            .map_err(|e| CadenceError::file("seek", &path, e))?;
        io::write_all_vectored(&mut file, &path, &[bytemuck::cast_slice(&values)])?;

        self.max_timestamp = self.timestamp_of(frontier);
        Ok(consumed)
    }

    fn misfit(&self, point: &Datapoint) -> CadenceError {
        let reason = if point.duration != self.duration {
            "duration differs from the file's"
        } else {
            "off the file's cadence"
        };
        warn!(
            "Rejecting datapoint at {} (duration {}) inside dense file {}",
            point.timestamp,
            point.duration,
            self.file_name()
        );
        CadenceError::Unrepresentable {
            timestamp: point.timestamp,
            duration: point.duration,
            file: self.file_name(),
            reason,
        }
    }

    /// Create a dense file holding `values` in consecutive slots from `min_timestamp`
    pub fn create_filled(
        dir: &Path,
        min_timestamp: Timestamp,
        duration: i64,
        values: &[f64],
        config: &StorageConfig,
    ) -> Result<Self> {
        let mut file = Self::new(min_timestamp, duration);
        let path = file.path(dir);
        let mut out = io::open_for_write(&path, config.datapoint_file_mode, false)?;
        out.set_len(0)
            .map_err(|e| CadenceError::file("truncate", &path, e))?;
        io::write_all_vectored(&mut out, &path, &[bytemuck::cast_slice(values)])?;
        file.max_timestamp = file.timestamp_of(values.len() as i64);
        Ok(file)
    }
}
