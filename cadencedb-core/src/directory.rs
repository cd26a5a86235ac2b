//! Per-series directory of datapoint files

use crate::files::{DatapointFile, FileInfo, SparseFile};
use crate::ops::{ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{CadenceError, Result, Timestamp};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of writing one sorted batch into a directory
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Sparse files that crossed the optimize threshold, already renamed with `.opt`
    pub candidates: Vec<Timestamp>,
    /// One [`CadenceError::Unrepresentable`] per datapoint that was not stored
    pub rejected: Vec<CadenceError>,
}

impl WriteReport {
    /// Fold the rejections into one error, leaving none behind
    pub fn take_rejection(&mut self) -> Option<CadenceError> {
        let count = self.rejected.len();
        let first = self.rejected.drain(..).next()?;
        Some(CadenceError::Rejected {
            count,
            first: Box::new(first),
        })
    }
}

/// Sorted, non-overlapping datapoint files backing one series.
///
/// The file list is loaded lazily from the directory listing and kept in
/// step with every create and rename made through this type. After a failed
/// write it is reloaded from disk on next use.
#[derive(Debug)]
pub struct DatapointDirectory {
    path: PathBuf,
    files: Vec<DatapointFile>,
    filenames_read: bool,
}

impl DatapointDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: Vec::new(),
            filenames_read: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached files, sorted by `min_timestamp`
    pub fn files(&self) -> &[DatapointFile] {
        &self.files
    }

    /// Reload the file list from the directory listing.
    ///
    /// Entries no format recognizes are ignored. A missing directory holds no files.
    pub fn read_filenames(&mut self) -> Result<()> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.files.clear();
                self.filenames_read = true;
                return Ok(());
            }
            Err(e) => return Err(CadenceError::file("read_dir", &self.path, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CadenceError::file("read_dir", &self.path, e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match DatapointFile::from_filename(&self.path, name)? {
                Some(file) => files.push(file),
                None => debug!("Ignoring {} in {}", name, self.path.display()),
            }
        }

        files.sort_by_key(|f| f.min_timestamp());
        self.files = files;
        self.filenames_read = true;
        Ok(())
    }

    fn ensure_filenames(&mut self) -> Result<()> {
        if !self.filenames_read {
            self.read_filenames()?;
        }
        Ok(())
    }

    /// Index of the last file with `min_timestamp <= timestamp`, or 0
    pub fn find_first_potential_file(&self, timestamp: Timestamp) -> usize {
        self.files
            .partition_point(|f| f.min_timestamp() <= timestamp)
            .saturating_sub(1)
    }

    /// Index of the file starting exactly at `min_timestamp`
    pub fn position(&self, min_timestamp: Timestamp) -> Option<usize> {
        self.files
            .binary_search_by_key(&min_timestamp, |f| f.min_timestamp())
            .ok()
    }

    /// Fill the read buffer from the files covering `[op.next_time(), op.end_time())`
    pub fn read(&mut self, op: &mut ReadOperation, config: &StorageConfig) -> Result<()> {
        self.ensure_filenames()?;

        let mut index = self.find_first_potential_file(op.next_time());
        while op.wants_more() {
            while index < self.files.len() && self.files[index].end_timestamp() <= op.next_time() {
                index += 1;
            }
            let Some(file) = self.files.get(index) else {
                return Ok(());
            };
            if file.min_timestamp() >= op.end_time() {
                return Ok(());
            }

            file.read(&self.path, op, config)?;
            index += 1;
        }
        Ok(())
    }

    /// Write the whole operation, creating sparse files where nothing existing fits.
    ///
    /// A datapoint that falls inside a dense or constant file's range without
    /// fitting it is skipped and listed in the report; everything else is
    /// stored. On error the cached file list is dropped and reloaded on next use.
    pub fn write(
        &mut self,
        op: &mut WriteOperation<'_>,
        config: &StorageConfig,
    ) -> Result<WriteReport> {
        let result = self.write_files(op, config);
        if result.is_err() {
            self.filenames_read = false;
        }
        result
    }

    fn write_files(
        &mut self,
        op: &mut WriteOperation<'_>,
        config: &StorageConfig,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        let Some(first) = op.current() else {
            return Ok(report);
        };

        fs::create_dir_all(&self.path)
            .map_err(|e| CadenceError::file("create_dir", &self.path, e))?;
        self.ensure_filenames()?;

        let mut index = self.find_first_potential_file(first.timestamp);
        while let Some(cursor) = op.current() {
            if index < self.files.len() {
                op.set_max_writable_timestamp(self.ceiling_after(index));

                // This file and the next both start at or before the cursor
                if op.max_writable_timestamp() < cursor.timestamp {
                    index += 1;
                    continue;
                }

                if cursor.timestamp >= self.files[index].min_timestamp() {
                    let written = match self.files[index].write(&self.path, op, config) {
                        Ok(written) => written,
                        Err(e @ CadenceError::Unrepresentable { .. }) => {
                            op.advance(1);
                            report.rejected.push(e);
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    op.advance(written);
                    self.check_optimize(index, config, &mut report.candidates)?;
                    // Stay on this file until it refuses the cursor
                    if written > 0 {
                        continue;
                    }
                    index += 1;
                }
            }

            // No existing file takes the cursor; start a sparse file that ends
            // before the next one.
            let ceiling = match self.files.get(index) {
                Some(next) => next.min_timestamp() - 1,
                None => Timestamp::MAX,
            };
            op.set_max_writable_timestamp(ceiling);

            let mut file = SparseFile::new(cursor.timestamp);
            let written = file.write(&self.path, op, config)?;
            if written == 0 {
                return Err(CadenceError::Internal(format!(
                    "new sparse file at {} in {} accepted no datapoints",
                    cursor.timestamp,
                    self.path.display()
                )));
            }
            op.advance(written);
            debug!("Created {} in {}", file.file_name(), self.path.display());

            self.files.insert(index, DatapointFile::Sparse(file));
            self.check_optimize(index, config, &mut report.candidates)?;
            index += 1;
        }

        Ok(report)
    }

    /// Inclusive ceiling for writes into the file at `index`
    fn ceiling_after(&self, index: usize) -> Timestamp {
        match self.files.get(index + 1) {
            Some(next) => next.min_timestamp() - 1,
            None => Timestamp::MAX,
        }
    }

    fn check_optimize(
        &mut self,
        index: usize,
        config: &StorageConfig,
        candidates: &mut Vec<Timestamp>,
    ) -> Result<()> {
        if let DatapointFile::Sparse(file) = &mut self.files[index] {
            if file.needs_optimization(config) {
                file.mark_optimized(&self.path)?;
                info!(
                    "Sparse file {} reached {} bytes, queueing for optimization",
                    file.path(&self.path).display(),
                    file.size_bytes()
                );
                candidates.push(file.min_timestamp());
            }
        }
        Ok(())
    }

    /// Summaries of every file, loading the listing if needed
    pub fn describe(&mut self) -> Result<Vec<FileInfo>> {
        self.ensure_filenames()?;
        Ok(self.files.iter().map(DatapointFile::info).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{DenseFile, FileKind};
    use crate::ops::RawBuffer;
    use crate::{Datapoint, DATAPOINT_SIZE};
    use tempfile::TempDir;

    fn read_range(dir: &mut DatapointDirectory, start: i64, end: i64) -> Vec<(i64, f64)> {
        let mut op = ReadOperation::new(start, end, None, false, 4096);
        dir.read(&mut op, &StorageConfig::default()).unwrap();
        op.buffer().iter().map(|p| (p.timestamp, p.value)).collect()
    }

    fn write(dir: &mut DatapointDirectory, points: &[Datapoint], config: &StorageConfig) -> Vec<i64> {
        let raw = RawBuffer(points);
        let mut op = WriteOperation::new(&raw);
        let report = dir.write(&mut op, config).unwrap();
        assert!(op.is_complete());
        assert!(report.rejected.is_empty());
        report.candidates
    }

    #[test]
    fn test_missing_directory_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path().join("absent"));
        assert!(read_range(&mut dir, 0, 100).is_empty());
        assert!(dir.describe().unwrap().is_empty());
    }

    #[test]
    fn test_find_first_potential_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        for name in ["10-19", "20-29", "40-49"] {
            std::fs::write(temp_dir.path().join(name), []).unwrap();
        }
        dir.read_filenames().unwrap();

        assert_eq!(dir.find_first_potential_file(0), 0);
        assert_eq!(dir.find_first_potential_file(10), 0);
        assert_eq!(dir.find_first_potential_file(25), 1);
        assert_eq!(dir.find_first_potential_file(30), 1);
        assert_eq!(dir.find_first_potential_file(1000), 2);
        assert_eq!(dir.position(20), Some(1));
        assert_eq!(dir.position(21), None);
    }

    #[test]
    fn test_write_creates_sparse_file_and_reads_back() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path().join("series"));
        let config = StorageConfig::default();

        let points: Vec<Datapoint> = (0..5).map(|i| Datapoint::new(i * 3, i as f64, 1)).collect();
        assert!(write(&mut dir, &points, &config).is_empty());

        let files = dir.describe().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, FileKind::Sparse);
        assert_eq!(files[0].file_name, "0-12");

        assert_eq!(read_range(&mut dir, 3, 10), vec![(3, 1.0), (6, 2.0), (9, 3.0)]);

        // Appending extends the same file
        write(&mut dir, &[Datapoint::new(20, 9.0, 1)], &config);
        dir.read_filenames().unwrap();
        assert_eq!(dir.files().len(), 1);
        assert_eq!(dir.files()[0].file_name(), "0-20");
    }

    #[test]
    fn test_full_files_spill_into_minimum_new_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = StorageConfig {
            sparse_file_max_size: 4 * DATAPOINT_SIZE as u64,
            sparse_file_optimize_size: 4 * DATAPOINT_SIZE as u64,
            ..StorageConfig::default()
        };

        let points: Vec<Datapoint> = (0..10).map(|i| Datapoint::new(i, 1.0, 1)).collect();
        let candidates = write(&mut dir, &points, &config);

        let names: Vec<String> = dir.files().iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["0-3.opt", "4-7.opt", "8-9"]);
        assert_eq!(candidates, vec![0, 4]);

        let values: Vec<i64> = read_range(&mut dir, 0, 100).iter().map(|p| p.0).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_new_files_respect_next_file_ceiling() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = StorageConfig::default();

        write(&mut dir, &[Datapoint::new(50, 1.0, 1)], &config);

        // Straddles the existing file: one new file below it, the rest appended to it
        let points = vec![
            Datapoint::new(10, 1.0, 1),
            Datapoint::new(20, 2.0, 1),
            Datapoint::new(60, 3.0, 1),
        ];
        write(&mut dir, &points, &config);

        let names: Vec<String> = dir.files().iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["10-20", "50-60"]);
        assert_eq!(
            read_range(&mut dir, 0, 100),
            vec![(10, 1.0), (20, 2.0), (50, 1.0), (60, 3.0)]
        );
    }

    #[test]
    fn test_dense_refusal_creates_sparse_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = StorageConfig {
            max_dense_nan_gap: 1,
            ..StorageConfig::default()
        };

        let seed: Vec<Datapoint> = (0..3).map(|i| Datapoint::new(i * 10, 1.0, 10)).collect();
        let raw = RawBuffer(&seed);
        let mut dense = DenseFile::new(0, 10);
        dense
            .write(temp_dir.path(), &WriteOperation::new(&raw), &config)
            .unwrap();
        dir.read_filenames().unwrap();

        let points = vec![Datapoint::new(30, 2.0, 10), Datapoint::new(100, 3.0, 10)];
        write(&mut dir, &points, &config);

        let kinds: Vec<FileKind> = dir.files().iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec![FileKind::Dense, FileKind::Sparse]);
        assert_eq!(dir.files()[1].file_name(), "100-100");
        assert_eq!(
            read_range(&mut dir, 0, 1000),
            vec![(0, 1.0), (10, 1.0), (20, 1.0), (30, 2.0), (100, 3.0)]
        );
    }

    #[test]
    fn test_unfit_points_are_reported_not_stored() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = StorageConfig::default();

        let seed: Vec<Datapoint> = (0..4).map(|i| Datapoint::new(i * 10, 1.0, 10)).collect();
        let raw = RawBuffer(&seed);
        DenseFile::new(0, 10)
            .write(temp_dir.path(), &WriteOperation::new(&raw), &config)
            .unwrap();
        dir.read_filenames().unwrap();

        let points = vec![
            Datapoint::new(10, 7.0, 10),
            Datapoint::new(15, 99.0, 10),
            Datapoint::new(20, 8.0, 10),
            Datapoint::new(25, 98.0, 1),
            Datapoint::new(5000, 9.0, 10),
        ];
        let raw = RawBuffer(&points);
        let mut op = WriteOperation::new(&raw);
        let mut report = dir.write(&mut op, &config).unwrap();
        assert!(op.is_complete());

        let rejected: Vec<i64> = report
            .rejected
            .iter()
            .map(|e| match e {
                CadenceError::Unrepresentable { timestamp, .. } => *timestamp,
                other => panic!("unexpected error {other:?}"),
            })
            .collect();
        assert_eq!(rejected, vec![15, 25]);
        let err = report.take_rejection().unwrap();
        assert!(matches!(err, CadenceError::Rejected { count: 2, .. }));
        assert!(report.rejected.is_empty());

        // Nothing was written inside the dense file's range except its own slots
        let names: Vec<String> = dir.files().iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["0@10", "5000-5000"]);
        assert_eq!(
            read_range(&mut dir, 0, 10_000),
            vec![(0, 1.0), (10, 7.0), (20, 8.0), (30, 1.0), (5000, 9.0)]
        );
    }

    #[test]
    fn test_failed_write_resyncs_file_list() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = StorageConfig::default();

        write(&mut dir, &[Datapoint::new(10, 1.0, 1), Datapoint::new(15, 1.5, 1)], &config);
        assert_eq!(dir.files()[0].file_name(), "10-15");

        // The cached file is swapped for something appends cannot open
        std::fs::remove_file(temp_dir.path().join("10-15")).unwrap();
        std::fs::create_dir(temp_dir.path().join("10-15")).unwrap();

        // 1 goes into a new file before 10-15, then 12 fails
        let points = vec![Datapoint::new(1, 0.5, 1), Datapoint::new(12, 1.2, 1)];
        let raw = RawBuffer(&points);
        let mut op = WriteOperation::new(&raw);
        assert!(dir.write(&mut op, &config).is_err());

        let fresh = DatapointDirectory::new(temp_dir.path()).describe().unwrap();
        assert_eq!(dir.describe().unwrap(), fresh);
        let names: Vec<String> = fresh.iter().map(|f| f.file_name.clone()).collect();
        assert_eq!(names, vec!["1-1"]);
    }
}
