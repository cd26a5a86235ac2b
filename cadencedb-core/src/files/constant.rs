//! Constant datapoint files
//!
//! A run of evenly spaced datapoints sharing one value. The file is empty on
//! disk; everything is carried by its name.

use super::{align_up, io, DenseFile, NameParser};
use crate::float::almost_equals;
use crate::ops::{ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{CadenceError, Datapoint, Result, Timestamp};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Payload-free file named `<min_timestamp>@<duration>x<count>=<value>`
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantFile {
    min_timestamp: Timestamp,
    duration: i64,
    count: i64,
    value: f64,
}

impl ConstantFile {
    pub fn new(min_timestamp: Timestamp, duration: i64, count: i64, value: f64) -> Self {
        Self {
            min_timestamp,
            duration,
            count,
            value,
        }
    }

    /// Create the zero-length backing file for an empty run
    pub fn create(
        dir: &Path,
        min_timestamp: Timestamp,
        duration: i64,
        value: f64,
        config: &StorageConfig,
    ) -> Result<Self> {
        let file = Self::new(min_timestamp, duration, 0, value);
        io::open_for_write(&file.path(dir), config.datapoint_file_mode, false)?;
        Ok(file)
    }

    /// Parse `<min_timestamp>@<duration>x<count>=<value>`
    pub fn parse_filename(name: &str) -> Option<(Timestamp, i64, i64, f64)> {
        let mut parser = NameParser::new(name);
        let min = parser.int()?;
        parser.expect('@')?;
        let duration = parser.int()?;
        parser.expect('x')?;
        let count = parser.int()?;
        parser.expect('=')?;
        let value = parser.float()?;

        if value.is_nan() {
            error!("Ignoring constant file {} with a NaN value", name);
            return None;
        }
        (duration > 0 && count >= 0).then_some((min, duration, count, value))
    }

    pub fn file_name(&self) -> String {
        // Debug output round-trips and uses exponent form for extreme magnitudes
        format!(
            "{}@{}x{}={:?}",
            self.min_timestamp, self.duration, self.count, self.value
        )
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    /// Exclusive end of the run
    pub fn max_timestamp(&self) -> Timestamp {
        self.min_timestamp
            .saturating_add(self.count.saturating_mul(self.duration))
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    fn on_cadence(&self, point: &Datapoint) -> bool {
        point.duration == self.duration
            && point.timestamp >= self.min_timestamp
            && (point.timestamp - self.min_timestamp) % self.duration == 0
    }

    fn matches(&self, point: &Datapoint) -> bool {
        self.on_cadence(point) && almost_equals(point.value, self.value)
    }

    /// Synthesize the run's datapoints in `[op.next_time(), op.end_time())`
    pub fn read(&self, op: &mut ReadOperation) {
        let start = op.next_time().max(self.min_timestamp);
        let Some(mut timestamp) = align_up(start, self.min_timestamp, self.duration) else {
            return;
        };
        let end = self.max_timestamp().min(op.end_time());

        while timestamp < end && op.wants_more() {
            op.append(Datapoint::new(timestamp, self.value, self.duration));
            timestamp = match timestamp.checked_add(self.duration) {
                Some(next) => next,
                None => break,
            };
        }
    }

    /// True when the operation would change the value of a tick inside the run.
    ///
    /// Walks the same prefix [`write`](Self::write) would consume, so ticks
    /// appended earlier in the operation count as part of the run.
    pub fn needs_revision(&self, op: &WriteOperation<'_>) -> bool {
        let mut end = self.max_timestamp();
        for point in op.points(op.writable_datapoints()) {
            if point.timestamp < end {
                if self.on_cadence(&point) && !almost_equals(point.value, self.value) {
                    return true;
                }
                continue;
            }
            if point.timestamp != end || !self.matches(&point) {
                break;
            }
            end = end.saturating_add(self.duration);
        }
        false
    }

    /// Rewrite the run as a dense file with one slot per tick and remove this file
    pub fn materialize(&self, dir: &Path, config: &StorageConfig) -> Result<DenseFile> {
        let values = vec![self.value; self.count as usize];
        let dense =
            DenseFile::create_filled(dir, self.min_timestamp, self.duration, &values, config)?;

        if let Err(e) = fs::remove_file(self.path(dir)) {
            let _ = fs::remove_file(dense.path(dir));
            return Err(CadenceError::file("remove", self.path(dir), e));
        }
        info!(
            "Materialized constant run {} as dense file {}",
            self.file_name(),
            dense.file_name()
        );
        Ok(dense)
    }

    /// Extend the run with datapoints that continue it exactly.
    ///
    /// A point already covered by the run is a no-op when it matches. One that
    /// does not is an [`CadenceError::Unrepresentable`] error when it is the
    /// first one offered, and ends the write otherwise. The write also stops at
    /// the first point past the run that does not continue it.
    pub fn write(&mut self, dir: &Path, op: &WriteOperation<'_>) -> Result<usize> {
        let writable = op.writable_datapoints();
        let mut consumed = 0;
        let mut appended = 0;
        let mut end = self.max_timestamp();

        for point in op.points(writable) {
            if point.timestamp < end {
                if !self.matches(&point) {
                    if consumed == 0 {
                        return Err(self.misfit(&point));
                    }
                    break;
                }
                consumed += 1;
                continue;
            }
            if point.timestamp != end || !self.matches(&point) {
                break;
            }
            appended += 1;
            consumed += 1;
            end = end.saturating_add(self.duration);
        }

        if appended > 0 {
            let from = self.path(dir);
            let previous = self.count;
            self.count += appended;
            if let Err(e) = io::rename(&from, &self.path(dir)) {
                self.count = previous;
                return Err(e);
            }
            debug!("Extended constant run to {}", self.file_name());
        }
        Ok(consumed)
    }

    fn misfit(&self, point: &Datapoint) -> CadenceError {
        let reason = if point.duration != self.duration {
            "duration differs from the file's"
        } else if self.on_cadence(point) {
            "value differs from the run's"
        } else {
            "off the file's cadence"
        };
        warn!(
            "Rejecting datapoint at {} (value {}, duration {}) inside constant file {}",
            point.timestamp,
            point.value,
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
}
