//! Storage optimizer
//!
//! Sparse files that grow past the optimize threshold are reviewed off the
//! write path. When their contents fit a more compact encoding they are
//! rewritten as a dense or constant file and the sparse file is removed.

use crate::directory::DatapointDirectory;
use crate::files::{ConstantFile, DatapointFile, DenseFile, FileKind};
use crate::float::almost_equals;
use crate::ops::{RawBuffer, ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{Datapoint, Result, Timestamp, DATAPOINT_SIZE};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// True when the points form one cadence with bounded holes.
///
/// Every point must share the first point's positive duration, and every
/// gap must be a whole number of durations leaving at most
/// `max_dense_nan_padding` empty slots.
pub fn is_dense(points: &[Datapoint], config: &StorageConfig) -> bool {
    if points.len() < config.min_datapoints_for_dense {
        return false;
    }
    let Some(duration) = points.first().map(|p| p.duration) else {
        return false;
    };
    if duration <= 0 {
        return false;
    }

    points.windows(2).all(|pair| {
        let gap = pair[1].timestamp - pair[0].timestamp;
        pair[1].duration == duration
            && gap > 0
            && gap % duration == 0
            && (gap / duration - 1) as u64 <= config.max_dense_nan_padding
    })
}

/// True when every value is indistinguishable from the first
pub fn is_constant(points: &[Datapoint], config: &StorageConfig) -> bool {
    if points.len() < config.min_datapoints_for_constant {
        return false;
    }
    let Some(first) = points.first().map(|p| p.value) else {
        return false;
    };
    points.iter().all(|p| almost_equals(p.value, first))
}

/// True when a dense run has no empty slots
fn is_gapless(points: &[Datapoint]) -> bool {
    match (points.first(), points.last()) {
        (Some(first), Some(last)) => {
            last.timestamp - first.timestamp == (points.len() as i64 - 1) * first.duration
        }
        _ => false,
    }
}

/// Encoding a sparse file's contents should be rewritten into, if any
pub fn choose_encoding(points: &[Datapoint], config: &StorageConfig) -> Option<FileKind> {
    if !is_dense(points, config) {
        return None;
    }
    if is_constant(points, config) && is_gapless(points) {
        Some(FileKind::Constant)
    } else {
        Some(FileKind::Dense)
    }
}

/// Review the sparse file starting at `min_timestamp` and convert it when possible.
///
/// Returns the new encoding, or `None` when the file was left alone.
pub fn optimize_sparse_file(
    directory: &mut DatapointDirectory,
    min_timestamp: Timestamp,
    config: &StorageConfig,
) -> Result<Option<FileKind>> {
    let Some(index) = directory.position(min_timestamp) else {
        debug!(
            "No file at {} in {} to optimize",
            min_timestamp,
            directory.path().display()
        );
        return Ok(None);
    };
    let DatapointFile::Sparse(sparse) = &directory.files()[index] else {
        return Ok(None);
    };
    let sparse_path = sparse.path(directory.path());

    let capacity = (config.sparse_file_max_size / DATAPOINT_SIZE as u64) as usize;
    let mut op = ReadOperation::new(Timestamp::MIN, Timestamp::MAX, None, false, capacity);
    sparse.read(directory.path(), &mut op, config)?;
    let points = op.buffer();

    let Some(kind) = choose_encoding(points, config) else {
        debug!(
            "Leaving {} ({} datapoints) as sparse",
            sparse_path.display(),
            points.len()
        );
        return Ok(None);
    };

    let dir = directory.path().to_path_buf();
    let Some(new_file) = convert(&dir, points, kind, config)? else {
        return Ok(None);
    };

    if let Err(e) = fs::remove_file(&sparse_path) {
        warn!(
            "Failed to remove {} after converting it to {}: {}",
            sparse_path.display(),
            new_file.file_name(),
            e
        );
    }
    info!(
        "Converted {} ({} datapoints) into {} file {}",
        sparse_path.display(),
        points.len(),
        kind,
        new_file.file_name()
    );

    directory.read_filenames()?;
    Ok(Some(kind))
}

/// Write `points` into a new file of the given kind.
///
/// If the new file cannot hold every point it is removed again and `None` is returned.
fn convert(
    dir: &Path,
    points: &[Datapoint],
    kind: FileKind,
    config: &StorageConfig,
) -> Result<Option<DatapointFile>> {
    let Some(&first) = points.first() else {
        return Ok(None);
    };
    let mut file = match kind {
        FileKind::Constant => DatapointFile::Constant(ConstantFile::create(
            dir,
            first.timestamp,
            first.duration,
            first.value,
            config,
        )?),
        FileKind::Dense => DatapointFile::Dense(DenseFile::new(first.timestamp, first.duration)),
        FileKind::Sparse => return Ok(None),
    };

    let raw = RawBuffer(points);
    let op = WriteOperation::new(&raw);
    let written = file.write(dir, &op, config)?;

    if written != points.len() {
        warn!(
            "{} file {} took {} of {} datapoints, keeping sparse data",
            kind,
            file.file_name(),
            written,
            points.len()
        );
        if let Err(e) = fs::remove_file(file.path(dir)) {
            warn!("Failed to remove partial {}: {}", file.file_name(), e);
        }
        return Ok(None);
    }
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(start: i64, step: i64, count: i64, value: impl Fn(i64) -> f64) -> Vec<Datapoint> {
        (0..count)
            .map(|i| Datapoint::new(start + i * step, value(i), step))
            .collect()
    }

    #[test]
    fn test_is_dense_boundaries() {
        let config = StorageConfig::default();

        assert!(is_dense(&run(0, 10, 32, |_| 1.0), &config));
        assert!(!is_dense(&run(0, 10, 31, |_| 1.0), &config));

        let mut mismatched = run(0, 10, 40, |_| 1.0);
        mismatched[20].duration = 5;
        assert!(!is_dense(&mismatched, &config));

        let mut uneven = run(0, 10, 40, |_| 1.0);
        for p in &mut uneven[20..] {
            p.timestamp += 3;
        }
        assert!(!is_dense(&uneven, &config));

        // A hole of exactly the padding limit is fine, one more slot is not
        let mut holed = run(0, 10, 40, |_| 1.0);
        for p in &mut holed[20..] {
            p.timestamp += 10 * config.max_dense_nan_padding as i64;
        }
        assert!(is_dense(&holed, &config));
        for p in &mut holed[20..] {
            p.timestamp += 10;
        }
        assert!(!is_dense(&holed, &config));
    }

    #[test]
    fn test_is_constant_tolerates_rounding() {
        let config = StorageConfig::default();
        let tiny = f64::EPSILON / 4.0;

        let wobbly = run(0, 1, 40, |i| match i % 3 {
            0 => 1.0,
            1 => 1.0 + tiny,
            _ => 1.0 - tiny,
        });
        assert!(is_constant(&wobbly, &config));

        let mut off = run(0, 1, 40, |_| 0.1);
        off[39].value = 0.100000000000001;
        assert!(!is_constant(&off, &config));

        assert!(!is_constant(&run(0, 1, 31, |_| 0.1), &config));
    }

    #[test]
    fn test_empty_input_is_never_classified() {
        let config = StorageConfig {
            min_datapoints_for_dense: 0,
            min_datapoints_for_constant: 0,
            ..StorageConfig::default()
        };
        assert!(!is_dense(&[], &config));
        assert!(!is_constant(&[], &config));
        assert_eq!(choose_encoding(&[], &config), None);
    }

    #[test]
    fn test_choose_encoding() {
        let config = StorageConfig::default();

        assert_eq!(
            choose_encoding(&run(0, 10, 40, |_| 1.0), &config),
            Some(FileKind::Constant)
        );
        assert_eq!(
            choose_encoding(&run(0, 10, 40, |i| i as f64), &config),
            Some(FileKind::Dense)
        );

        let mut holed = run(0, 10, 40, |_| 1.0);
        holed.remove(5);
        assert_eq!(choose_encoding(&holed, &config), Some(FileKind::Dense));

        let irregular: Vec<Datapoint> = (0..40)
            .map(|i| Datapoint::new(i * i, 1.0, 10))
            .collect();
        assert_eq!(choose_encoding(&irregular, &config), None);
    }

    fn sparse_config() -> StorageConfig {
        StorageConfig {
            sparse_file_optimize_size: 40 * DATAPOINT_SIZE as u64,
            ..StorageConfig::default()
        }
    }

    fn write_sparse(dir: &mut DatapointDirectory, points: &[Datapoint], config: &StorageConfig) -> Vec<i64> {
        let raw = RawBuffer(points);
        let mut op = WriteOperation::new(&raw);
        dir.write(&mut op, config).unwrap().candidates
    }

    fn read_all(dir: &mut DatapointDirectory) -> Vec<Datapoint> {
        let mut op = ReadOperation::new(0, 400, None, false, 1024);
        dir.read(&mut op, &StorageConfig::default()).unwrap();
        op.buffer().to_vec()
    }

    #[test]
    fn test_constant_run_replaces_sparse_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = sparse_config();

        let points = run(0, 10, 40, |_| 1.0);
        let candidates = write_sparse(&mut dir, &points, &config);
        assert_eq!(candidates, vec![0]);

        let kind = optimize_sparse_file(&mut dir, 0, &config).unwrap();
        assert_eq!(kind, Some(FileKind::Constant));

        let names: Vec<String> = dir.files().iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["0@10x40=1.0"]);
        assert!(!temp_dir.path().join("0-390.opt").exists());

        let read = read_all(&mut dir);
        assert_eq!(read.len(), 40);
        for (got, want) in read.iter().zip(&points) {
            assert_eq!((got.timestamp, got.value, got.duration), (want.timestamp, 1.0, 10));
        }
    }

    #[test]
    fn test_varying_run_becomes_dense() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = sparse_config();

        let mut points = run(0, 10, 41, |i| i as f64);
        points.remove(7);
        write_sparse(&mut dir, &points, &config);

        let kind = optimize_sparse_file(&mut dir, 0, &config).unwrap();
        assert_eq!(kind, Some(FileKind::Dense));
        assert_eq!(dir.files().len(), 1);
        assert_eq!(dir.files()[0].file_name(), "0@10");

        let read: Vec<(i64, f64)> = read_all(&mut dir).iter().map(|p| (p.timestamp, p.value)).collect();
        let want: Vec<(i64, f64)> = points.iter().map(|p| (p.timestamp, p.value)).collect();
        assert_eq!(read, want);
    }

    #[test]
    fn test_irregular_file_is_left_alone() {
        let temp_dir = TempDir::new().unwrap();
        let mut dir = DatapointDirectory::new(temp_dir.path());
        let config = sparse_config();

        let points: Vec<Datapoint> = (0..40).map(|i| Datapoint::new(i * 7, 1.0, 3)).collect();
        write_sparse(&mut dir, &points, &config);

        assert_eq!(optimize_sparse_file(&mut dir, 0, &config).unwrap(), None);
        assert_eq!(dir.files()[0].kind(), FileKind::Sparse);
        assert_eq!(optimize_sparse_file(&mut dir, 12345, &config).unwrap(), None);
    }
}
