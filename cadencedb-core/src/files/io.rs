//! Low-level file helpers shared by the datapoint file formats

use crate::{CadenceError, Result};
use bytemuck::Pod;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, IoSlice, Read, Write};
use std::path::Path;

/// Open (creating if needed) a datapoint file for writing
pub(crate) fn open_for_write(path: &Path, mode: u32, append: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).append(append);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    options
        .open(path)
        .map_err(|e| CadenceError::file("open", path, e))
}

pub(crate) fn open_for_read(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| CadenceError::file("open", path, e))
}

/// Size of a file in bytes, zero when it does not exist yet
pub(crate) fn file_size(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(CadenceError::file("stat", path, e)),
    }
}

pub(crate) fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| CadenceError::file("rename", from, e))
}

/// Read up to `count` values from the current position.
///
/// A short file yields fewer values; a trailing partial value is dropped.
pub(crate) fn read_values<T: Pod>(file: &mut File, path: &Path, count: usize) -> Result<Vec<T>> {
    let mut values = vec![T::zeroed(); count];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut values);

    let mut filled = 0;
    while filled < bytes.len() {
        match file.read(&mut bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CadenceError::file("read", path, e)),
        }
    }

    values.truncate(filled / std::mem::size_of::<T>());
    Ok(values)
}

/// Write every span, in order, with as few syscalls as possible.
///
/// Partial writes resume where the kernel stopped; interrupted calls are retried.
pub(crate) fn write_all_vectored(file: &mut File, path: &Path, spans: &[&[u8]]) -> Result<()> {
    let mut pending: Vec<&[u8]> = spans.iter().copied().filter(|s| !s.is_empty()).collect();
    let mut first = 0;

    while first < pending.len() {
        let slices: Vec<IoSlice<'_>> = pending[first..].iter().map(|s| IoSlice::new(s)).collect();
        match file.write_vectored(&slices) {
            Ok(0) => {
                return Err(CadenceError::file(
                    "write",
                    path,
                    std::io::Error::from(ErrorKind::WriteZero),
                ))
            }
            Ok(mut written) => {
                while first < pending.len() && written >= pending[first].len() {
                    written -= pending[first].len();
                    first += 1;
                }
                if written > 0 {
                    pending[first] = &pending[first][written..];
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CadenceError::file("write", path, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vectored_write_then_read_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("values");

        let a = [1.0f64, 2.0];
        let b = [3.0f64];
        let spans: [&[u8]; 3] = [bytemuck::cast_slice(&a), &[], bytemuck::cast_slice(&b)];
        let mut file = open_for_write(&path, 0o644, true).unwrap();
        write_all_vectored(&mut file, &path, &spans).unwrap();
        drop(file);

        assert_eq!(file_size(&path).unwrap(), 24);

        let mut file = open_for_read(&path).unwrap();
        let values: Vec<f64> = read_values(&mut file, &path, 10).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_missing_file_has_zero_size() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(file_size(&temp_dir.path().join("nope")).unwrap(), 0);
        assert!(matches!(
            open_for_read(&temp_dir.path().join("nope")),
            Err(CadenceError::File { op: "open", .. })
        ));
    }
}
