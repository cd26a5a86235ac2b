//! A single time series: one write buffer in front of one datapoint directory

use crate::buffer::WriteBuffer;
use crate::directory::{DatapointDirectory, WriteReport};
use crate::files::{FileInfo, FileKind};
use crate::ops::{ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{optimizer, series_dir, series_hash, Datapoint, Result, Timestamp};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subdirectory of the data directory holding every series
pub const DATAPOINTS_DIR: &str = "datapoints";

struct SeriesState {
    buffer: WriteBuffer,
    directory: DatapointDirectory,
}

/// Per-key coordinator for buffered writes, flushes and merged reads.
///
/// Every call for a series is expected to run on the worker that owns it, so
/// the state lock is never contended. The buffered count is readable from any
/// thread for flush ranking.
pub struct Series {
    key: String,
    hash: u64,
    config: Arc<StorageConfig>,
    state: Mutex<SeriesState>,
    buffered: AtomicUsize,
}

impl Series {
    /// Create a series for a canonical key; nothing touches disk until the first flush
    pub fn new(key: impl Into<String>, config: Arc<StorageConfig>) -> Self {
        let key = key.into();
        let hash = series_hash(&key);
        let path = config.data_dir.join(DATAPOINTS_DIR).join(series_dir(hash));

        Self {
            state: Mutex::new(SeriesState {
                buffer: WriteBuffer::new(config.write_buffer_pages_per_alloc),
                directory: DatapointDirectory::new(path),
            }),
            key,
            hash,
            config,
            buffered: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Content hash of the key; picks the directory and the owning worker
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().directory.path().to_path_buf()
    }

    /// Buffer datapoints for the next flush; NaN values are dropped
    pub fn write(&self, points: &[Datapoint]) -> usize {
        let mut state = self.state.lock();
        let stored = state.buffer.append(points);
        self.buffered.store(state.buffer.len(), Ordering::Relaxed);
        stored
    }

    pub fn datapoints_buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Read one chunk: flushed data first, then buffered datapoints that
    /// extend past what the files returned.
    ///
    /// Buffered datapoints older than the files' last emitted point are not
    /// visible until they are flushed. When the chunk has room left the read
    /// is finished.
    pub fn read(&self, op: &mut ReadOperation) -> Result<()> {
        let mut state = self.state.lock();
        let SeriesState { buffer, directory } = &mut *state;

        directory
            .read(op, &self.config)
            .map_err(|e| e.for_series(&self.key))?;

        if op.wants_more() && !buffer.is_empty() {
            buffer.sort();
            let mut index = buffer.lower_bound(op.next_time());
            while index < buffer.len() && op.wants_more() {
                let point = buffer.get(index);
                if point.timestamp >= op.end_time() {
                    break;
                }
                if point.timestamp >= op.next_time() {
                    op.append(point);
                }
                index += 1;
            }
        }

        if op.space_left() > 0 {
            op.finish();
        }
        Ok(())
    }

    /// Move every buffered datapoint to disk.
    ///
    /// The report lists the sparse files that should now be optimized and the
    /// datapoints no file could hold; those are dropped with the buffer. On
    /// failure the buffer is kept so a later flush can retry.
    pub fn flush(&self) -> Result<WriteReport> {
        let mut state = self.state.lock();
        let SeriesState { buffer, directory } = &mut *state;
        if buffer.is_empty() {
            return Ok(WriteReport::default());
        }

        buffer.sort();
        let mut op = WriteOperation::new(&*buffer);
        let report = directory
            .write(&mut op, &self.config)
            .map_err(|e| e.for_series(&self.key))?;

        if !report.rejected.is_empty() {
            warn!(
                "Dropped {} of {} datapoints for {} that no file could hold",
                report.rejected.len(),
                buffer.len(),
                self.key
            );
        }
        debug!("Flushed {} datapoints for {}", buffer.len(), self.key);
        buffer.clear();
        self.buffered.store(0, Ordering::Relaxed);
        Ok(report)
    }

    /// Run the optimizer over the sparse file starting at `min_timestamp`
    pub fn optimize(&self, min_timestamp: Timestamp) -> Result<Option<FileKind>> {
        let mut state = self.state.lock();
        let converted =
            optimizer::optimize_sparse_file(&mut state.directory, min_timestamp, &self.config)
                .map_err(|e| e.for_series(&self.key))?;
        if let Some(kind) = converted {
            info!("Series {} file {} is now {}", self.key, min_timestamp, kind);
        }
        Ok(converted)
    }

    /// Files currently backing the series
    pub fn describe(&self) -> Result<Vec<FileInfo>> {
        self.state
            .lock()
            .directory
            .describe()
            .map_err(|e| e.for_series(&self.key))
    }
}

impl std::fmt::Debug for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Series")
            .field("key", &self.key)
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("buffered", &self.datapoints_buffered())
            .finish()
    }
}

/// Root of a series' files under `data_dir`
pub fn series_path(data_dir: &Path, key: &str) -> PathBuf {
    data_dir.join(DATAPOINTS_DIR).join(series_dir(series_hash(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATAPOINT_SIZE;
    use tempfile::TempDir;

    fn series(temp_dir: &TempDir, config: StorageConfig) -> Series {
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..config
        };
        Series::new("host=a;metric=cpu;", Arc::new(config))
    }

    fn read_chunks(series: &Series, start: i64, end: i64, capacity: usize) -> Vec<Vec<(i64, f64)>> {
        let mut op = ReadOperation::new(start, end, None, false, capacity);
        let mut chunks = Vec::new();
        loop {
            series.read(&mut op).unwrap();
            if op.datapoints_in_buffer() > 0 {
                chunks.push(op.buffer().iter().map(|p| (p.timestamp, p.value)).collect());
            }
            op.clear_buffer();
            if op.is_complete() {
                break;
            }
        }
        chunks
    }

    #[test]
    fn test_buffered_points_visible_before_flush() {
        let temp_dir = TempDir::new().unwrap();
        let series = series(&temp_dir, StorageConfig::default());

        assert_eq!(series.write(&[Datapoint::new(1, 1.0, 1), Datapoint::new(2, f64::NAN, 1)]), 1);
        assert_eq!(series.datapoints_buffered(), 1);
        assert!(!series.path().exists());

        assert_eq!(read_chunks(&series, 0, 10, 16), vec![vec![(1, 1.0)]]);
        assert_eq!(
            series.path(),
            series_path(temp_dir.path(), "host=a;metric=cpu;")
        );
    }

    #[test]
    fn test_flush_moves_buffer_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let series = series(&temp_dir, StorageConfig::default());

        series.write(&[Datapoint::new(5, 5.0, 1), Datapoint::new(1, 1.0, 1)]);
        assert!(series.flush().unwrap().candidates.is_empty());
        assert_eq!(series.datapoints_buffered(), 0);
        assert!(series.path().join("1-5").exists());

        series.write(&[Datapoint::new(9, 9.0, 1)]);
        assert_eq!(
            read_chunks(&series, 0, 100, 16),
            vec![vec![(1, 1.0), (5, 5.0), (9, 9.0)]]
        );
    }

    #[test]
    fn test_backfill_hidden_until_flushed() {
        let temp_dir = TempDir::new().unwrap();
        let series = series(&temp_dir, StorageConfig::default());

        series.write(&[Datapoint::new(10, 1.0, 1), Datapoint::new(20, 2.0, 1)]);
        series.flush().unwrap();
        series.write(&[Datapoint::new(15, 1.5, 1), Datapoint::new(30, 3.0, 1)]);

        assert_eq!(
            read_chunks(&series, 0, 100, 16),
            vec![vec![(10, 1.0), (20, 2.0), (30, 3.0)]]
        );

        series.flush().unwrap();
        assert_eq!(
            read_chunks(&series, 0, 100, 16),
            vec![vec![(10, 1.0), (15, 1.5), (20, 2.0), (30, 3.0)]]
        );
    }

    #[test]
    fn test_chunked_read_matches_single_read() {
        let temp_dir = TempDir::new().unwrap();
        let series = series(&temp_dir, StorageConfig::default());

        let points: Vec<Datapoint> = (0..25).map(|i| Datapoint::new(i * 2, i as f64, 1)).collect();
        series.write(&points[..20]);
        series.flush().unwrap();
        series.write(&points[20..]);

        let whole: Vec<(i64, f64)> = read_chunks(&series, 0, 1000, 1000).concat();
        let chunks = read_chunks(&series, 0, 1000, 7);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.concat(), whole);
        assert_eq!(whole.len(), 25);
    }

    #[test]
    fn test_flush_reports_optimize_candidates() {
        let temp_dir = TempDir::new().unwrap();
        let series = series(
            &temp_dir,
            StorageConfig {
                sparse_file_optimize_size: 40 * DATAPOINT_SIZE as u64,
                ..StorageConfig::default()
            },
        );

        let points: Vec<Datapoint> = (0..40).map(|i| Datapoint::new(i * 10, 1.0, 10)).collect();
        series.write(&points);
        assert_eq!(series.flush().unwrap().candidates, vec![0]);
        assert_eq!(series.optimize(0).unwrap(), Some(FileKind::Constant));

        let files = series.describe().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "0@10x40=1.0");
        assert_eq!(read_chunks(&series, 0, 400, 100).concat().len(), 40);
    }

    #[test]
    fn test_failed_flush_keeps_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let series = series(&temp_dir, StorageConfig::default());

        series.write(&[Datapoint::new(10, 1.0, 1), Datapoint::new(15, 1.5, 1)]);
        series.flush().unwrap();

        let blocker = series.path().join("10-15");
        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir(&blocker).unwrap();

        series.write(&[Datapoint::new(12, 1.2, 1)]);
        let err = series.flush().unwrap_err();
        assert!(matches!(err, crate::CadenceError::Series { .. }));
        assert_eq!(series.datapoints_buffered(), 1);
        assert_eq!(read_chunks(&series, 0, 100, 16), vec![vec![(12, 1.2)]]);

        // Once the obstacle is gone the retry lands the point
        std::fs::remove_dir(&blocker).unwrap();
        series.flush().unwrap();
        assert_eq!(series.datapoints_buffered(), 0);
        let files = series.describe().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "12-12");
    }
}
